//! Board service notifications to typed actions.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::delta::{
    Action, ChecklistAction, CloseAction, CommentAction, Delta, LabelAction, ListAction,
    MemberAction,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub closed: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckItemRef {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    pub board: Option<NamedRef>,
    pub card: Option<CardRef>,
    pub list: Option<NamedRef>,
    pub list_before: Option<NamedRef>,
    pub list_after: Option<NamedRef>,
    pub old: Option<Value>,
    pub label: Option<LabelRef>,
    pub checklist: Option<NamedRef>,
    pub check_item: Option<CheckItemRef>,
    pub text: Option<String>,
    pub id_member: Option<String>,
    pub member: Option<MemberRef>,
}

/// One entry of a notification's `deltas` array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id_member_creator: Option<String>,
    #[serde(default)]
    pub member_creator: Option<MemberRef>,
    #[serde(default)]
    pub data: ActionData,
}

impl BoardAction {
    pub fn board_id(&self) -> Option<&str> {
        self.data.board.as_ref()?.id.as_deref()
    }

    pub fn card(&self) -> Option<&CardRef> {
        self.data.card.as_ref()
    }

    /// Maps the action to a change. `member_name` resolves member ids to
    /// display names.
    pub fn change(&self, member_name: impl Fn(&str) -> Option<String>) -> Option<Action> {
        let data = &self.data;
        match self.kind.as_str() {
            "createCard" => {
                let list = data.list.as_ref()?.name.clone()?;
                Some(Action::List(ListAction::moved(list, None)))
            }
            "updateCard" => {
                if let (Some(before), Some(after)) = (&data.list_before, &data.list_after) {
                    let after = after.name.clone()?;
                    return Some(Action::List(ListAction::moved(after, before.name.clone())));
                }
                let was_closed = data.old.as_ref()?.get("closed")?.as_bool()?;
                let closed = data
                    .card
                    .as_ref()
                    .and_then(|card| card.closed)
                    .unwrap_or(!was_closed);
                Some(Action::Close(CloseAction::set(closed)))
            }
            "addMemberToCard" => {
                Some(Action::Member(MemberAction::added(self.member_subject(member_name)?)))
            }
            "removeMemberFromCard" => Some(Action::Member(MemberAction::removed(
                self.member_subject(member_name)?,
            ))),
            "addLabelToCard" => {
                let label = data.label.as_ref()?;
                let name = non_empty(label.name.as_deref())
                    .or_else(|| non_empty(label.color.as_deref()))?;
                Some(Action::Label(LabelAction::added(name)))
            }
            "addChecklistToCard" => {
                let list = data.checklist.as_ref()?.name.clone()?;
                Some(Action::Checklist(ChecklistAction::added(list)))
            }
            "updateCheckItemStateOnCard" | "updateCheckitemStateOnCard" => {
                let list = data.checklist.as_ref()?.name.clone()?;
                let item = data.check_item.as_ref()?;
                let complete = item.state.as_deref() == Some("complete");
                Some(Action::Checklist(ChecklistAction::item(
                    list,
                    item.name.clone(),
                    complete,
                )))
            }
            "commentCard" => Some(Action::Comment(CommentAction::new(data.text.clone()?))),
            _ => None,
        }
    }

    /// Builds the single-action delta for this event, or `None` when the
    /// event carries no card or no reportable change.
    pub fn to_delta(
        &self,
        actor: &str,
        member_name: impl Fn(&str) -> Option<String>,
    ) -> Option<Delta> {
        let card = self.card()?;
        let action = self.change(member_name)?;
        let label = card.name.clone().unwrap_or_default();
        Some(Delta::new(card.id.clone(), label, actor).apply(action))
    }

    fn member_subject(&self, member_name: impl Fn(&str) -> Option<String>) -> Option<String> {
        let member = self.data.member.as_ref();
        let id = self
            .data
            .id_member
            .as_deref()
            .or_else(|| member.and_then(|m| m.id.as_deref()));
        id.and_then(&member_name)
            .or_else(|| member.and_then(|m| m.username.clone()))
            .or_else(|| id.map(str::to_string))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug)]
pub enum Notification {
    Actions(Vec<BoardAction>),
    /// Model updates the relay does not report.
    Ignored,
    Unknown(String),
}

pub fn classify(payload: &Value) -> Notification {
    let type_name = payload
        .get("typeName")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match type_name {
        "Action" => {
            let deltas = payload
                .get("deltas")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let actions = deltas
                .iter()
                .filter_map(|delta| match BoardAction::deserialize(delta) {
                    Ok(action) => Some(action),
                    Err(err) => {
                        warn!(target = "relay", error = %err, "skipping malformed action");
                        None
                    }
                })
                .collect();
            Notification::Actions(actions)
        }
        "Member" | "Checklist" | "Card" | "Board" | "List" => Notification::Ignored,
        other => Notification::Unknown(other.to_string()),
    }
}
