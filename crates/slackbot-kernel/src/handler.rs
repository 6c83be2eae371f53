use serde_json::{json, Value};
use slackbot_contracts::{
    BlockAction, EventEnvelope, InteractionPayload, MenuOptionsQuery, SlackEvent,
    SlashCommandParams,
};
use thiserror::Error;

use crate::args::Args;
use crate::callback::{Callback, CallbackError, Principal};
use crate::router::CommandTarget;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0} is not implemented by this handler")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("{0}")]
    Failed(String),
}

/// What the webhook layer should do once a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Acknowledge with an empty body.
    Nothing,
    /// Return this JSON as the HTTP response body.
    Respond(Value),
    /// Persist a callback for the handler and open `view` as a modal bound to it.
    OpenModal {
        view: Value,
        payload: Option<Value>,
    },
    /// Replace the modal the current interaction came from.
    UpdateModal { view: Value },
    /// Publish `view` to the user's App Home.
    PublishView { user_id: String, view: Value },
    /// Post a message; `channel` defaults to the channel the request came from.
    PostMessage {
        channel: Option<String>,
        text: String,
        blocks: Option<Value>,
    },
}

impl Reply {
    pub fn respond(response_type: &str, text: &str) -> Self {
        Reply::Respond(json!({ "response_type": response_type, "text": text }))
    }

    pub fn ephemeral(text: &str) -> Self {
        Self::respond("ephemeral", text)
    }
}

pub struct CommandContext<'a> {
    pub current_user: Option<&'a Principal>,
    pub params: &'a SlashCommandParams,
    pub route: &'a CommandTarget,
    pub args: Args,
}

impl CommandContext<'_> {
    pub fn command(&self) -> &str {
        &self.params.command
    }

    pub fn text(&self) -> &str {
        &self.params.text
    }
}

pub struct InteractionContext<'a> {
    pub current_user: &'a Principal,
    pub payload: &'a InteractionPayload,
    pub callback: &'a mut Callback,
}

impl InteractionContext<'_> {
    pub fn interaction_type(&self) -> &str {
        &self.payload.kind
    }

    pub fn actions(&self) -> &[BlockAction] {
        &self.payload.actions
    }

    pub fn view_id(&self) -> Option<&str> {
        self.payload.view.as_ref().and_then(|v| v.id.as_deref())
    }

    /// Replaces the callback args with the first action's value and saves.
    /// Returns `false` when the interaction carried no actions.
    pub fn update_callback_args(&mut self) -> Result<bool, CallbackError> {
        let value = match self.payload.actions.first() {
            Some(action) => action.value.clone(),
            None => return Ok(false),
        };
        self.callback.args_mut().set_raw(value.as_deref());
        self.callback.save()?;
        Ok(true)
    }

    /// Applies every action to the callback args through `apply`, then saves.
    pub fn update_callback_args_with<F>(&mut self, mut apply: F) -> Result<bool, CallbackError>
    where
        F: FnMut(&mut Args, &BlockAction),
    {
        let payload = self.payload;
        if payload.actions.is_empty() {
            return Ok(false);
        }
        for action in &payload.actions {
            apply(self.callback.args_mut(), action);
        }
        self.callback.save()?;
        Ok(true)
    }
}

pub struct EventContext<'a> {
    pub current_user: Option<&'a Principal>,
    pub envelope: &'a EventEnvelope,
    pub event: &'a SlackEvent,
}

pub struct MenuOptionsContext<'a> {
    pub current_user: Option<&'a Principal>,
    pub query: &'a MenuOptionsQuery,
}

/// A slash command, interaction, event or menu options handler, registered by name.
///
/// One handler usually serves a slash command and the interactions of the
/// modals it opens, since callbacks record the handler name that created them.
pub trait Handler: Send + Sync {
    fn command(&self, _ctx: &mut CommandContext<'_>) -> Result<Reply, HandlerError> {
        Err(HandlerError::NotImplemented("command"))
    }

    fn interaction(&self, _ctx: &mut InteractionContext<'_>) -> Result<Reply, HandlerError> {
        Ok(Reply::Nothing)
    }

    fn event(&self, _ctx: &EventContext<'_>) -> Result<Reply, HandlerError> {
        Ok(Reply::Nothing)
    }

    fn menu_options(&self, _ctx: &MenuOptionsContext<'_>) -> Result<Reply, HandlerError> {
        Err(HandlerError::NotImplemented("menu_options"))
    }

    /// Commands require a resolved principal.
    fn only_user(&self) -> bool {
        true
    }

    fn only_direct_message(&self) -> bool {
        true
    }

    fn only_slack_team(&self) -> bool {
        true
    }
}
