//! Accumulated changes to a single card by a single actor.
//!
//! A [`Delta`] holds one slot per [`ActionKind`]. Incoming events are
//! folded in with [`Delta::apply`], and two deltas for the same card and
//! actor combine slot by slot with [`Delta::merge`]. Merging is
//! associative, and changes that undo each other cancel out, so a burst
//! of edits collapses into one line of chat or into nothing at all.

mod action;

pub use action::{
    Action, ActionKind, Change, ChecklistAction, ChecklistState, CloseAction, CommentAction,
    LabelAction, ListAction, MemberAction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub subject_id: String,
    pub subject_label: String,
    pub actor_id: String,
    pub url: Option<String>,
    list: ListAction,
    close: CloseAction,
    member: MemberAction,
    label: LabelAction,
    checklist: ChecklistAction,
    comment: CommentAction,
}

impl Delta {
    pub fn new(
        subject_id: impl Into<String>,
        subject_label: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            subject_label: subject_label.into(),
            actor_id: actor_id.into(),
            url: None,
            list: ListAction::default(),
            close: CloseAction::default(),
            member: MemberAction::default(),
            label: LabelAction::default(),
            checklist: ChecklistAction::default(),
            comment: CommentAction::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Folds one action into its slot.
    pub fn apply(mut self, action: Action) -> Self {
        match action {
            Action::List(a) => self.list = self.list.merge(&a),
            Action::Close(a) => self.close = self.close.merge(&a),
            Action::Member(a) => self.member = self.member.merge(&a),
            Action::Label(a) => self.label = self.label.merge(&a),
            Action::Checklist(a) => self.checklist = self.checklist.merge(&a),
            Action::Comment(a) => self.comment = self.comment.merge(&a),
        }
        self
    }

    /// Current content of one slot.
    pub fn action(&self, kind: ActionKind) -> Action {
        match kind {
            ActionKind::List => Action::List(self.list.clone()),
            ActionKind::Close => Action::Close(self.close.clone()),
            ActionKind::Member => Action::Member(self.member.clone()),
            ActionKind::Label => Action::Label(self.label.clone()),
            ActionKind::Checklist => Action::Checklist(self.checklist.clone()),
            ActionKind::Comment => Action::Comment(self.comment.clone()),
        }
    }

    pub fn is_mergeable_with(&self, other: &Delta) -> bool {
        self.subject_id == other.subject_id && self.actor_id == other.actor_id
    }

    /// Combines `self` with a later delta for the same card and actor.
    ///
    /// The later label and url win when present.
    pub fn merge(&self, later: &Delta) -> Delta {
        Delta {
            subject_id: self.subject_id.clone(),
            subject_label: later.subject_label.clone(),
            actor_id: self.actor_id.clone(),
            url: later.url.clone().or_else(|| self.url.clone()),
            list: self.list.merge(&later.list),
            close: self.close.merge(&later.close),
            member: self.member.merge(&later.member),
            label: self.label.merge(&later.label),
            checklist: self.checklist.merge(&later.checklist),
            comment: self.comment.merge(&later.comment),
        }
    }

    pub fn fragments(&self) -> Vec<String> {
        ActionKind::ALL
            .iter()
            .flat_map(|kind| self.action(*kind).render())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments().is_empty()
    }

    /// `@actor "label" [<url>] fragments...`, or `None` when nothing is left
    /// to report.
    pub fn render(&self) -> Option<String> {
        let fragments = self.fragments();
        if fragments.is_empty() {
            return None;
        }
        let mut line = format!("@{} \"{}\"", self.actor_id, self.subject_label);
        if let Some(url) = &self.url {
            line.push_str(&format!(" <{url}>"));
        }
        for fragment in fragments {
            line.push(' ');
            line.push_str(&fragment);
        }
        Some(line)
    }
}
