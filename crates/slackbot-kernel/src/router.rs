use std::collections::HashMap;

pub const ROUTE_DELIMITER: &str = " ";

pub type NodeId = usize;

/// One token of a registered slash command, e.g. `game` in `/bot start game`.
#[derive(Debug, Clone)]
pub struct RouteNode {
    token: String,
    handler: String,
    ancestors: Vec<NodeId>,
    full_token: String,
    children: HashMap<String, NodeId>,
}

impl RouteNode {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Ancestor node ids, outermost first.
    pub fn ancestors(&self) -> &[NodeId] {
        &self.ancestors
    }

    /// Ancestor tokens followed by this token, joined by a space.
    pub fn full_token(&self) -> &str {
        &self.full_token
    }

    pub fn child(&self, token: &str) -> Option<NodeId> {
        self.children.get(token).copied()
    }
}

/// What a command text resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub handler: String,
    /// Matched route path; empty when the endpoint default handler is used.
    pub full_token: String,
    /// Text left after the route path and one separating whitespace character.
    pub args: String,
}

/// Routes registered under one slash command request URL (`/commands/{url_token}`).
#[derive(Debug, Clone)]
pub struct CommandEndpoint {
    url_token: String,
    handler: Option<String>,
    nodes: Vec<RouteNode>,
    roots: HashMap<String, NodeId>,
    routes: HashMap<String, NodeId>,
}

impl CommandEndpoint {
    pub fn new(url_token: impl Into<String>, handler: Option<&str>) -> Self {
        Self {
            url_token: url_token.into(),
            handler: handler.map(|v| v.to_string()),
            nodes: Vec::new(),
            roots: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    pub fn url_token(&self) -> &str {
        &self.url_token
    }

    /// Handler used when no route matches.
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    pub fn set_handler(&mut self, handler: Option<&str>) {
        self.handler = handler.map(|v| v.to_string());
    }

    /// Registers a top-level command. Registering a token again returns the
    /// existing route and keeps its original handler.
    pub fn command(&mut self, token: &str, handler: &str) -> RouteBuilder<'_> {
        let node = match self.roots.get(token) {
            Some(id) => *id,
            None => {
                let id = self.insert_node(None, token, handler);
                self.roots.insert(token.to_string(), id);
                id
            }
        };
        RouteBuilder {
            endpoint: self,
            node,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&RouteNode> {
        self.nodes.get(id)
    }

    pub fn route(&self, full_token: &str) -> Option<&RouteNode> {
        self.routes.get(full_token).and_then(|id| self.node(*id))
    }

    /// Registered full paths, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.routes.keys().map(|k| k.as_str()).collect();
        routes.sort_unstable();
        routes
    }

    /// Finds the most specific registered path that `text` starts with,
    /// where the path must be followed by whitespace or the end of `text`.
    pub fn find_command_config(&self, text: &str) -> Option<&RouteNode> {
        self.routes
            .iter()
            .filter(|(path, _)| matches_route(text, path))
            .max_by_key(|(path, _)| path.len())
            .and_then(|(_, id)| self.node(*id))
    }

    /// Resolves `text` to a route (or the endpoint default) and its residual arguments.
    pub fn resolve(&self, text: &str) -> Option<CommandTarget> {
        let (handler, full_token) = match self.find_command_config(text) {
            Some(node) => (node.handler.clone(), node.full_token.clone()),
            None => (self.handler.clone()?, String::new()),
        };
        let args = residual_args(text, &full_token);
        Some(CommandTarget {
            handler,
            full_token,
            args,
        })
    }

    fn insert_node(&mut self, parent: Option<NodeId>, token: &str, handler: &str) -> NodeId {
        let (ancestors, full_token) = match parent {
            Some(parent_id) => {
                let parent = &self.nodes[parent_id];
                let mut ancestors = parent.ancestors.clone();
                ancestors.push(parent_id);
                (
                    ancestors,
                    format!("{}{}{}", parent.full_token, ROUTE_DELIMITER, token),
                )
            }
            None => (Vec::new(), token.to_string()),
        };
        let id = self.nodes.len();
        self.nodes.push(RouteNode {
            token: token.to_string(),
            handler: handler.to_string(),
            ancestors,
            full_token: full_token.clone(),
            children: HashMap::new(),
        });
        self.routes.insert(full_token, id);
        if let Some(parent) = parent.and_then(|id| self.nodes.get_mut(id)) {
            parent.children.insert(token.to_string(), id);
        }
        id
    }
}

fn matches_route(text: &str, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    match text.strip_prefix(path) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

fn residual_args(text: &str, full_token: &str) -> String {
    let rest = text.strip_prefix(full_token).unwrap_or(text);
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_whitespace() => chars.as_str().to_string(),
        _ => rest.to_string(),
    }
}

/// Cursor over a registered route, used to chain argument commands.
pub struct RouteBuilder<'a> {
    endpoint: &'a mut CommandEndpoint,
    node: NodeId,
}

impl RouteBuilder<'_> {
    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn full_token(&self) -> &str {
        &self.endpoint.nodes[self.node].full_token
    }

    /// Registers `token` beneath this route. The child reuses this route's
    /// handler unless one is given; registering a token again returns the
    /// existing child.
    pub fn argument_command(&mut self, token: &str, handler: Option<&str>) -> RouteBuilder<'_> {
        let parent = self.node;
        let existing = self.endpoint.nodes[parent].children.get(token).copied();
        let node = match existing {
            Some(id) => id,
            None => {
                let handler = handler
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| self.endpoint.nodes[parent].handler.clone());
                self.endpoint.insert_node(Some(parent), token, &handler)
            }
        };
        RouteBuilder {
            endpoint: &mut *self.endpoint,
            node,
        }
    }
}
