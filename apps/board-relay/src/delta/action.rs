use std::collections::{BTreeMap, BTreeSet};

const COMMENT_PREVIEW_LEN: usize = 30;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    List,
    Close,
    Member,
    Label,
    Checklist,
    Comment,
}

impl ActionKind {
    /// Render order of the slots in a delta.
    pub const ALL: [ActionKind; 6] = [
        ActionKind::List,
        ActionKind::Close,
        ActionKind::Member,
        ActionKind::Label,
        ActionKind::Checklist,
        ActionKind::Comment,
    ];
}

/// Merge algebra shared by every action kind.
///
/// `Default` is the identity: it renders nothing and merging it in from
/// either side leaves the other operand unchanged.
pub trait Change: Clone + Default + PartialEq {
    fn merge(&self, later: &Self) -> Self;
    fn render(&self) -> Vec<String>;

    fn is_empty(&self) -> bool {
        self.render().is_empty()
    }
}

/// Card moved between lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListAction {
    pub name: Option<String>,
    pub old_name: Option<String>,
}

impl ListAction {
    pub fn moved(name: impl Into<String>, old_name: Option<String>) -> Self {
        Self {
            name: Some(name.into()),
            old_name,
        }
    }
}

impl Change for ListAction {
    fn merge(&self, later: &Self) -> Self {
        let name = later.name.clone().or_else(|| self.name.clone());
        // The first move's origin wins once the first slot knows where it went.
        let old_name = if self.name.is_some() {
            self.old_name.clone()
        } else {
            later.old_name.clone()
        };
        if name == old_name {
            return Self::default();
        }
        Self { name, old_name }
    }

    fn render(&self) -> Vec<String> {
        match (&self.old_name, &self.name) {
            (Some(old), Some(name)) => vec![format!("{old} -> {name}")],
            (None, Some(name)) => vec![format!("-> {name}")],
            _ => Vec::new(),
        }
    }
}

/// Archive state toggle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseAction {
    pub closed: Option<bool>,
}

impl CloseAction {
    pub fn set(closed: bool) -> Self {
        Self {
            closed: Some(closed),
        }
    }
}

impl Change for CloseAction {
    fn merge(&self, later: &Self) -> Self {
        match (self.closed, later.closed) {
            (_, None) => self.clone(),
            (Some(_), Some(_)) => Self::default(),
            (None, Some(closed)) => Self::set(closed),
        }
    }

    fn render(&self) -> Vec<String> {
        match self.closed {
            Some(true) => vec!["archive".to_string()],
            Some(false) => vec!["unarchive".to_string()],
            None => Vec::new(),
        }
    }
}

/// Members joining or leaving a card, rendered in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberAction {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl MemberAction {
    pub fn added(member: impl Into<String>) -> Self {
        Self {
            added: BTreeSet::from([member.into()]),
            removed: BTreeSet::new(),
        }
    }

    pub fn removed(member: impl Into<String>) -> Self {
        Self {
            added: BTreeSet::new(),
            removed: BTreeSet::from([member.into()]),
        }
    }
}

/// `mine` minus what `later` undid, plus `theirs` minus what `mine` undid.
fn survivors(
    mine: &BTreeSet<String>,
    theirs: &BTreeSet<String>,
    undone_later: &BTreeSet<String>,
    undone_earlier: &BTreeSet<String>,
) -> BTreeSet<String> {
    mine.difference(undone_later)
        .chain(theirs.difference(undone_earlier))
        .cloned()
        .collect()
}

impl Change for MemberAction {
    fn merge(&self, later: &Self) -> Self {
        Self {
            added: survivors(&self.added, &later.added, &later.removed, &self.removed),
            removed: survivors(&self.removed, &later.removed, &later.added, &self.added),
        }
    }

    fn render(&self) -> Vec<String> {
        self.added
            .iter()
            .map(|id| format!("+@{id}"))
            .chain(self.removed.iter().map(|id| format!("-@{id}")))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelAction {
    pub names: Vec<String>,
}

impl LabelAction {
    pub fn added(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }
}

impl Change for LabelAction {
    fn merge(&self, later: &Self) -> Self {
        let mut names = self.names.clone();
        for name in &later.names {
            push_unique(&mut names, name);
        }
        Self { names }
    }

    fn render(&self) -> Vec<String> {
        self.names.iter().map(|name| format!("#{name}")).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistState {
    pub added: bool,
    /// Item name to completion state.
    pub items: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistAction {
    pub lists: BTreeMap<String, ChecklistState>,
}

impl ChecklistAction {
    pub fn added(list: impl Into<String>) -> Self {
        let mut lists = BTreeMap::new();
        lists.insert(
            list.into(),
            ChecklistState {
                added: true,
                items: BTreeMap::new(),
            },
        );
        Self { lists }
    }

    pub fn item(list: impl Into<String>, item: impl Into<String>, complete: bool) -> Self {
        let mut items = BTreeMap::new();
        items.insert(item.into(), complete);
        let mut lists = BTreeMap::new();
        lists.insert(
            list.into(),
            ChecklistState {
                added: false,
                items,
            },
        );
        Self { lists }
    }
}

impl Change for ChecklistAction {
    fn merge(&self, later: &Self) -> Self {
        let mut lists = self.lists.clone();
        for (name, incoming) in &later.lists {
            let state = lists.entry(name.clone()).or_default();
            state.added |= incoming.added;
            for (item, complete) in &incoming.items {
                // A second toggle of the same item undoes the first.
                if state.items.remove(item).is_none() {
                    state.items.insert(item.clone(), *complete);
                }
            }
        }
        lists.retain(|_, state| state.added || !state.items.is_empty());
        Self { lists }
    }

    fn render(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, state) in &self.lists {
            if !state.added && state.items.is_empty() {
                continue;
            }
            let marker = if state.added { "+" } else { "" };
            out.push(format!("({marker}{name})"));
            for (item, complete) in &state.items {
                let glyph = if *complete { 'x' } else { ' ' };
                out.push(format!("[{glyph}]{item}"));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentAction {
    pub texts: Vec<String>,
}

impl CommentAction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            texts: vec![text.into()],
        }
    }
}

impl Change for CommentAction {
    fn merge(&self, later: &Self) -> Self {
        let mut texts = self.texts.clone();
        texts.extend(later.texts.iter().cloned());
        Self { texts }
    }

    fn render(&self) -> Vec<String> {
        self.texts
            .iter()
            .map(|text| format!("\"{}\"", preview(text)))
            .collect()
    }
}

fn preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= COMMENT_PREVIEW_LEN {
        return collapsed;
    }
    let keep = COMMENT_PREVIEW_LEN - ELLIPSIS.len();
    let mut out: String = collapsed.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

fn push_unique(out: &mut Vec<String>, value: &String) {
    if !out.contains(value) {
        out.push(value.clone());
    }
}

/// One change of a single kind, as produced from an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    List(ListAction),
    Close(CloseAction),
    Member(MemberAction),
    Label(LabelAction),
    Checklist(ChecklistAction),
    Comment(CommentAction),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::List(_) => ActionKind::List,
            Action::Close(_) => ActionKind::Close,
            Action::Member(_) => ActionKind::Member,
            Action::Label(_) => ActionKind::Label,
            Action::Checklist(_) => ActionKind::Checklist,
            Action::Comment(_) => ActionKind::Comment,
        }
    }

    /// Identity value for a kind.
    pub fn empty(kind: ActionKind) -> Self {
        match kind {
            ActionKind::List => Action::List(ListAction::default()),
            ActionKind::Close => Action::Close(CloseAction::default()),
            ActionKind::Member => Action::Member(MemberAction::default()),
            ActionKind::Label => Action::Label(LabelAction::default()),
            ActionKind::Checklist => Action::Checklist(ChecklistAction::default()),
            ActionKind::Comment => Action::Comment(CommentAction::default()),
        }
    }

    /// Merges two actions of the same kind; `None` when the kinds differ.
    pub fn merge(&self, later: &Action) -> Option<Action> {
        let merged = match (self, later) {
            (Action::List(a), Action::List(b)) => Action::List(a.merge(b)),
            (Action::Close(a), Action::Close(b)) => Action::Close(a.merge(b)),
            (Action::Member(a), Action::Member(b)) => Action::Member(a.merge(b)),
            (Action::Label(a), Action::Label(b)) => Action::Label(a.merge(b)),
            (Action::Checklist(a), Action::Checklist(b)) => Action::Checklist(a.merge(b)),
            (Action::Comment(a), Action::Comment(b)) => Action::Comment(a.merge(b)),
            _ => return None,
        };
        Some(merged)
    }

    pub fn render(&self) -> Vec<String> {
        match self {
            Action::List(a) => a.render(),
            Action::Close(a) => a.render(),
            Action::Member(a) => a.render(),
            Action::Label(a) => a.render(),
            Action::Checklist(a) => a.render(),
            Action::Comment(a) => a.render(),
        }
    }
}
