use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::callback::Principal;
use crate::handler::Handler;
use crate::registry::{HandlerNotFound, HandlerRegistry};
use crate::router::{CommandEndpoint, CommandTarget};

pub type UserFinder = Arc<dyn Fn(&str) -> Option<Principal> + Send + Sync>;

/// Everything the webhook layer dispatches through: named handlers, event and
/// menu options bindings, slash command endpoints and the user lookup.
pub struct BotConfig {
    handlers: HandlerRegistry<dyn Handler>,
    event_handlers: HashMap<String, String>,
    menu_options: HashMap<String, String>,
    endpoints: HashMap<String, CommandEndpoint>,
    user_finder: UserFinder,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            handlers: HandlerRegistry::new(),
            event_handlers: HashMap::new(),
            menu_options: HashMap::new(),
            endpoints: HashMap::new(),
            user_finder: Arc::new(|id: &str| Some(Principal::new(id))),
        }
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut endpoints: Vec<&str> = self.endpoints.keys().map(|k| k.as_str()).collect();
        endpoints.sort_unstable();
        f.debug_struct("BotConfig")
            .field("handlers", &self.handlers)
            .field("event_handlers", &self.event_handlers)
            .field("menu_options", &self.menu_options)
            .field("endpoints", &endpoints)
            .finish_non_exhaustive()
    }
}

impl BotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.register(name, handler);
        self
    }

    /// Registers an interaction-only handler; it shares the namespace callbacks
    /// record their handler name in.
    pub fn interaction(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handler(name, handler)
    }

    /// Binds an Events API event type to a registered handler name.
    pub fn event(&mut self, event_type: impl Into<String>, handler: impl Into<String>) -> &mut Self {
        self.event_handlers.insert(event_type.into(), handler.into());
        self
    }

    pub fn menu_options(&mut self, action_id: impl Into<String>, handler: impl Into<String>) -> &mut Self {
        self.menu_options.insert(action_id.into(), handler.into());
        self
    }

    /// Returns the endpoint for `url_token`, creating it on first use. A
    /// default handler given here replaces the existing one.
    pub fn slash_command_endpoint(
        &mut self,
        url_token: &str,
        handler: Option<&str>,
    ) -> &mut CommandEndpoint {
        let endpoint = self
            .endpoints
            .entry(url_token.to_string())
            .or_insert_with(|| CommandEndpoint::new(url_token, None));
        if handler.is_some() {
            endpoint.set_handler(handler);
        }
        endpoint
    }

    pub fn user_finder<F>(&mut self, finder: F) -> &mut Self
    where
        F: Fn(&str) -> Option<Principal> + Send + Sync + 'static,
    {
        self.user_finder = Arc::new(finder);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry<dyn Handler> {
        &self.handlers
    }

    pub fn endpoint(&self, url_token: &str) -> Option<&CommandEndpoint> {
        self.endpoints.get(url_token)
    }

    pub fn find_handler(&self, name: &str) -> Result<Arc<dyn Handler>, HandlerNotFound> {
        self.handlers.find(name)
    }

    /// `Ok(None)` when nothing is bound to the event type.
    pub fn find_event_handler(
        &self,
        event_type: &str,
    ) -> Result<Option<Arc<dyn Handler>>, HandlerNotFound> {
        self.event_handlers
            .get(event_type)
            .map(|name| self.handlers.find(name))
            .transpose()
    }

    pub fn event_handler_name(&self, event_type: &str) -> Option<&str> {
        self.event_handlers.get(event_type).map(|v| v.as_str())
    }

    pub fn menu_options_handler_name(&self, action_id: &str) -> Option<&str> {
        self.menu_options.get(action_id).map(|v| v.as_str())
    }

    pub fn find_menu_options(
        &self,
        action_id: &str,
    ) -> Result<Option<Arc<dyn Handler>>, HandlerNotFound> {
        self.menu_options
            .get(action_id)
            .map(|name| self.handlers.find(name))
            .transpose()
    }

    /// `None` when the endpoint is unknown, or no route matches and the
    /// endpoint has no default handler.
    pub fn find_slash_command(&self, url_token: &str, text: &str) -> Option<CommandTarget> {
        self.endpoints.get(url_token)?.resolve(text)
    }

    pub fn find_user(&self, user_id: &str) -> Option<Principal> {
        (self.user_finder)(user_id)
    }

    /// Checks that every name referenced by an endpoint, event or menu
    /// options binding is registered.
    pub fn validate(&self) -> Result<(), HandlerNotFound> {
        for endpoint in self.endpoints.values() {
            if let Some(name) = endpoint.handler() {
                self.handlers.find(name)?;
            }
            for path in endpoint.routes() {
                if let Some(route) = endpoint.route(path) {
                    self.handlers.find(route.handler())?;
                }
            }
        }
        for name in self.event_handlers.values().chain(self.menu_options.values()) {
            self.handlers.find(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CommandContext, HandlerError, Reply};

    struct Echo;

    impl Handler for Echo {
        fn command(&self, ctx: &mut CommandContext<'_>) -> Result<Reply, HandlerError> {
            Ok(Reply::ephemeral(ctx.text()))
        }
    }

    fn bot() -> BotConfig {
        let mut bot = BotConfig::new();
        bot.handler("Echo", Arc::new(Echo))
            .handler("Home", Arc::new(Echo))
            .event("app_home_opened", "Home")
            .menu_options("pick_user", "Echo");
        bot.slash_command_endpoint("game", Some("Echo"))
            .command("start", "Echo")
            .argument_command("game", None);
        bot
    }

    #[test]
    fn finds_commands_through_endpoints() {
        let bot = bot();
        let target = bot.find_slash_command("game", "start game now").unwrap();
        assert_eq!(target.full_token, "start game");
        assert_eq!(target.args, "now");
        assert!(bot.find_slash_command("unknown", "start").is_none());
        assert!(bot.validate().is_ok());
    }

    #[test]
    fn event_and_menu_bindings_resolve_to_handlers() {
        let bot = bot();
        assert!(bot.find_event_handler("app_home_opened").unwrap().is_some());
        assert!(bot.find_event_handler("message").unwrap().is_none());
        assert!(bot.find_menu_options("pick_user").unwrap().is_some());
        assert!(bot.find_menu_options("other").unwrap().is_none());
    }

    #[test]
    fn validate_reports_unregistered_names() {
        let mut bot = bot();
        bot.event("message", "Ghost");
        assert!(matches!(bot.find_event_handler("message"), Err(HandlerNotFound { .. })));
        assert_eq!(bot.validate().unwrap_err().name, "Ghost");
    }

    #[test]
    fn default_user_finder_wraps_the_id() {
        let mut bot = BotConfig::new();
        assert_eq!(bot.find_user("U1"), Some(Principal::new("U1")));
        bot.user_finder(|id| (id == "U1").then(|| Principal::new(id).with_team_id("T1")));
        assert_eq!(bot.find_user("U1").unwrap().team_id.as_deref(), Some("T1"));
        assert!(bot.find_user("U2").is_none());
    }
}
