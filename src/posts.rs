use crate::error::RecordError;
use crate::index::DumpIndex;
use crate::models::{Answer, Comment, LinkKind, PostLink, Question, RawRecord};
use crate::parser::XmlEvent;
use crate::resolve::{finalize_answers, Resolver};
use crate::stats::RunStats;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where inside a `post` element the stream currently is.
///
/// Comments are owned by whichever record the scope names when their group
/// closes: the question for `QuestionComments`, the last answer for `AnswerComments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Outside,
    Question,
    QuestionComments,
    Answers,
    /// Inside an answer `row` that has child elements
    Answer,
    /// `within_row` is set when the group is nested in the answer's `row`
    AnswerComments { within_row: bool },
}

impl Scope {
    fn label(self) -> &'static str {
        match self {
            Scope::Outside => "outside",
            Scope::Question => "post",
            Scope::QuestionComments => "post/comments",
            Scope::Answers => "post/answers",
            Scope::Answer => "post/answers/row",
            Scope::AnswerComments { .. } => "post/answers/comments",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one closed `post` element.
#[derive(Debug)]
pub enum Assembled {
    Question(Box<Question>),
    /// Dropped because it has no answers and unanswered questions are excluded
    Excluded { id: i64 },
    Failed { id: Option<String>, error: RecordError },
}

/// The record currently being assembled.
enum Open {
    Question(Box<Question>),
    /// Resolution failed; the rest of the element is consumed and discarded
    Poisoned { id: Option<String>, error: RecordError },
}

/// Consumes Posts stream events and yields one assembled question per `post`.
///
/// Holds at most one question with its answers and comments at a time.
pub struct PostAssembler {
    resolver: Resolver,
    stats: Arc<RunStats>,
    exclude_unanswered: bool,
    scope: Scope,
    current: Option<Open>,
    answers: Vec<Answer>,
    comments: Vec<Comment>,
    /// False when the last answer `row` failed to resolve; its comments are dropped
    row_valid: bool,
}

impl PostAssembler {
    pub fn new(resolver: Resolver, stats: Arc<RunStats>, exclude_unanswered: bool) -> Self {
        Self {
            resolver,
            stats,
            exclude_unanswered,
            scope: Scope::Outside,
            current: None,
            answers: Vec::new(),
            comments: Vec::new(),
            row_valid: true,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn feed(&mut self, index: &DumpIndex, event: XmlEvent) -> Option<Assembled> {
        match event {
            XmlEvent::Open { name, attrs } => {
                self.open(index, &name, attrs);
                None
            }
            XmlEvent::Close { name } => self.close(&name),
        }
    }

    fn open(&mut self, index: &DumpIndex, name: &str, attrs: RawRecord) {
        if self.scope == Scope::Outside {
            if name == "post" {
                self.start_post(index, attrs);
            } else {
                debug!(element = name, "Ignoring element outside post");
            }
            return;
        }
        if matches!(self.current, Some(Open::Poisoned { .. })) {
            self.track_poisoned_scope(name, true);
            return;
        }

        match (name, self.scope) {
            ("comments", Scope::Question) => {
                self.scope = Scope::QuestionComments;
                self.comments.clear();
            }
            ("comments", Scope::Answers) => {
                self.scope = Scope::AnswerComments { within_row: false };
                self.comments.clear();
            }
            ("comments", Scope::Answer) => {
                self.scope = Scope::AnswerComments { within_row: true };
                self.comments.clear();
            }
            ("answers", Scope::Question) => {
                self.scope = Scope::Answers;
                self.comments.clear();
                self.answers.clear();
                self.row_valid = true;
            }
            ("row", Scope::Answers) => {
                self.scope = Scope::Answer;
                self.row_valid = self.push_answer(index, attrs);
            }
            ("comment", Scope::QuestionComments) => self.push_comment(index, attrs),
            ("comment", Scope::AnswerComments { .. }) => {
                if self.row_valid {
                    self.push_comment(index, attrs);
                }
            }
            ("link", _) => self.push_link(attrs),
            ("post" | "comments" | "answers" | "row" | "comment", scope) => {
                let error = RecordError::Misplaced {
                    element: name.to_string(),
                    scope: scope.label(),
                };
                self.poison(error);
                self.track_poisoned_scope(name, true);
            }
            (other, scope) => debug!(element = other, scope = %scope, "Ignoring unknown element"),
        }
    }

    fn close(&mut self, name: &str) -> Option<Assembled> {
        if matches!(self.current, Some(Open::Poisoned { .. })) {
            self.track_poisoned_scope(name, false);
            return if self.scope == Scope::Outside {
                self.finish_post()
            } else {
                None
            };
        }

        match (name, self.scope) {
            ("comments", Scope::QuestionComments) => {
                let comments = mem::take(&mut self.comments);
                if let Some(Open::Question(question)) = &mut self.current {
                    question.comments.extend(comments);
                }
                self.scope = Scope::Question;
            }
            ("comments", Scope::AnswerComments { within_row }) => {
                let comments = mem::take(&mut self.comments);
                match self.answers.last_mut() {
                    Some(answer) if self.row_valid => answer.comments.extend(comments),
                    None if !comments.is_empty() => {
                        warn!(count = comments.len(), "Answer comments without an answer");
                    }
                    _ => {}
                }
                self.scope = if within_row { Scope::Answer } else { Scope::Answers };
            }
            ("row", Scope::Answer) => self.scope = Scope::Answers,
            ("answers", Scope::Answers) => {
                if let Some(Open::Question(question)) = &self.current {
                    finalize_answers(&mut self.answers, question.accepted_answer_id);
                }
                self.scope = Scope::Question;
            }
            ("post", Scope::Question) => {
                self.scope = Scope::Outside;
                return self.finish_post();
            }
            _ => {}
        }
        None
    }

    fn start_post(&mut self, index: &DumpIndex, attrs: RawRecord) {
        self.reset();
        self.scope = Scope::Question;
        let id = attrs.get("Id").map(str::to_string);
        self.current = Some(match self.resolver.resolve_question(index, attrs) {
            Ok(question) => Open::Question(Box::new(question)),
            Err(error) => Open::Poisoned { id, error },
        });
    }

    fn push_answer(&mut self, index: &DumpIndex, attrs: RawRecord) -> bool {
        let id = attrs.get("Id").map(str::to_string);
        match self.resolver.resolve_answer(index, attrs) {
            Ok(answer) => {
                self.answers.push(answer);
                true
            }
            Err(e) => {
                warn!(answer_id = ?id, error = %e, "Skipping malformed answer");
                self.stats.inc_malformed();
                false
            }
        }
    }

    fn push_comment(&mut self, index: &DumpIndex, attrs: RawRecord) {
        let id = attrs.get("Id").map(str::to_string);
        match self.resolver.resolve_comment(index, attrs) {
            Ok(comment) => self.comments.push(comment),
            Err(e) => {
                warn!(comment_id = ?id, error = %e, "Skipping malformed comment");
                self.stats.inc_malformed();
            }
        }
    }

    fn push_link(&mut self, attrs: RawRecord) {
        let Some(Open::Question(question)) = &mut self.current else {
            return;
        };
        let Some(kind) = attrs.get("LinkTypeId").and_then(LinkKind::from_type_id) else {
            return;
        };
        let source_id = question.id;
        match attrs.int("PostId") {
            Ok(target_id) => question.push_link(PostLink {
                source_id,
                target_id,
                target_title: attrs.get("PostName").unwrap_or_default().to_string(),
                kind,
            }),
            Err(e) => {
                warn!(question_id = source_id, error = %e, "Skipping malformed link");
                self.stats.inc_malformed();
            }
        }
    }

    fn poison(&mut self, error: RecordError) {
        let id = match self.current.take() {
            Some(Open::Question(question)) => Some(question.id.to_string()),
            Some(Open::Poisoned { id, .. }) => id,
            None => None,
        };
        self.current = Some(Open::Poisoned { id, error });
    }

    /// A poisoned post is skipped up to its matching `</post>`; only the nesting
    /// of structural elements is followed.
    fn track_poisoned_scope(&mut self, name: &str, opening: bool) {
        self.scope = match (name, self.scope, opening) {
            ("post", Scope::Question, false) => Scope::Outside,
            ("comments", Scope::Question, true) => Scope::QuestionComments,
            ("comments", Scope::QuestionComments, false) => Scope::Question,
            ("answers", Scope::Question, true) => Scope::Answers,
            ("answers", Scope::Answers, false) => Scope::Question,
            ("row", Scope::Answers, true) => Scope::Answer,
            ("row", Scope::Answer, false) => Scope::Answers,
            ("comments", Scope::Answers, true) => Scope::AnswerComments { within_row: false },
            ("comments", Scope::Answer, true) => Scope::AnswerComments { within_row: true },
            ("comments", Scope::AnswerComments { within_row }, false) => {
                if within_row {
                    Scope::Answer
                } else {
                    Scope::Answers
                }
            }
            (_, scope, _) => scope,
        };
    }

    fn finish_post(&mut self) -> Option<Assembled> {
        let current = self.current.take()?;
        let answers = mem::take(&mut self.answers);
        self.reset();

        match current {
            Open::Poisoned { id, error } => Some(Assembled::Failed { id, error }),
            Open::Question(question) if self.exclude_unanswered && answers.is_empty() => {
                Some(Assembled::Excluded { id: question.id })
            }
            Open::Question(mut question) => {
                question.answers = answers;
                Some(Assembled::Question(question))
            }
        }
    }

    fn reset(&mut self) {
        self.current = None;
        self.answers.clear();
        self.comments.clear();
        self.row_valid = true;
    }
}
