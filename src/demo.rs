//! Handlers the binary ships with: a paginated member directory modal, an
//! App Home tab, an external select source and a channel announcement.

use std::sync::Arc;

use serde_json::{json, Value};
use slackbot_kernel::{
    Args, BotConfig, CommandContext, EventContext, Handler, HandlerError,
    InteractionContext, MenuOptionsContext, Pager, Reply, SliceCursor,
};

pub const URL_TOKEN: &str = "bot";

const MEMBERS: &[&str] = &[
    "ada", "barbara", "claude", "dennis", "edsger", "frances", "grace", "guido", "ken", "linus",
    "margaret", "niklaus", "radia", "rob", "tony",
];
const PER_PAGE: usize = 5;

pub fn bot() -> BotConfig {
    let mut bot = BotConfig::new();
    bot.handler("Help", Arc::new(Help))
        .handler("Directory", Arc::new(Directory))
        .handler("Announce", Arc::new(Announce))
        .handler("HomeTab", Arc::new(HomeTab))
        .handler("MemberPicker", Arc::new(MemberPicker))
        .event("app_home_opened", "HomeTab")
        .menu_options("pick_member", "MemberPicker");

    let endpoint = bot.slash_command_endpoint(URL_TOKEN, Some("Help"));
    endpoint.command("members", "Directory");
    endpoint.command("announce", "Announce");
    bot
}

struct Help;

impl Handler for Help {
    fn command(&self, ctx: &mut CommandContext<'_>) -> Result<Reply, HandlerError> {
        Ok(Reply::ephemeral(&format!(
            "usage: {} members [page=N] | announce <text>",
            ctx.command()
        )))
    }
}

struct Directory;

impl Directory {
    fn view(args: &Args) -> Value {
        let pager = Pager::with_options(SliceCursor::new(MEMBERS), args, Some(PER_PAGE), None);
        let names: Vec<&str> = pager.cursor().items().to_vec();
        let mut blocks = vec![json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": names.join("\n")}
        })];

        let mut buttons = Vec::new();
        if pager.page() > 1 {
            buttons.push(page_button("prev", "Previous", pager.page() - 1));
        }
        if pager.page() < pager.pages_count() {
            buttons.push(page_button("next", "Next", pager.page() + 1));
        }
        if !buttons.is_empty() {
            blocks.push(json!({"type": "actions", "elements": buttons}));
        }
        blocks.push(json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("page {} of {} ({} members)", pager.page(), pager.pages_count(), pager.total_count())
            }]
        }));

        json!({
            "title": {"type": "plain_text", "text": "Members"},
            "close": {"type": "plain_text", "text": "Close"},
            "blocks": blocks,
        })
    }
}

fn page_button(action_id: &str, label: &str, page: usize) -> Value {
    json!({
        "type": "button",
        "action_id": action_id,
        "text": {"type": "plain_text", "text": label},
        "value": format!("page={page}"),
    })
}

impl Handler for Directory {
    fn command(&self, ctx: &mut CommandContext<'_>) -> Result<Reply, HandlerError> {
        Ok(Reply::OpenModal {
            view: Self::view(&ctx.args),
            payload: None,
        })
    }

    fn interaction(&self, ctx: &mut InteractionContext<'_>) -> Result<Reply, HandlerError> {
        if !ctx.update_callback_args()? {
            return Ok(Reply::Nothing);
        }
        Ok(Reply::UpdateModal {
            view: Self::view(ctx.callback.args()),
        })
    }
}

struct Announce;

impl Handler for Announce {
    fn command(&self, ctx: &mut CommandContext<'_>) -> Result<Reply, HandlerError> {
        let text = ctx.route.args.trim();
        if text.is_empty() {
            return Ok(Reply::ephemeral("nothing to announce"));
        }
        Ok(Reply::PostMessage {
            channel: None,
            text: text.to_string(),
            blocks: None,
        })
    }

    fn only_direct_message(&self) -> bool {
        false
    }
}

struct HomeTab;

impl Handler for HomeTab {
    fn event(&self, ctx: &EventContext<'_>) -> Result<Reply, HandlerError> {
        let Some(user_id) = ctx.event.user.clone() else {
            return Ok(Reply::Nothing);
        };
        Ok(Reply::PublishView {
            view: json!({
                "type": "home",
                "blocks": [{
                    "type": "section",
                    "text": {"type": "mrkdwn", "text": format!("Hello <@{user_id}>. Try `/{URL_TOKEN} members`.")}
                }]
            }),
            user_id,
        })
    }
}

struct MemberPicker;

impl Handler for MemberPicker {
    fn menu_options(&self, ctx: &MenuOptionsContext<'_>) -> Result<Reply, HandlerError> {
        let prefix = ctx.query.value.as_deref().unwrap_or_default().to_lowercase();
        let options: Vec<Value> = MEMBERS
            .iter()
            .filter(|name| name.starts_with(&prefix))
            .map(|name| json!({"text": {"type": "plain_text", "text": name}, "value": name}))
            .collect();
        Ok(Reply::Respond(json!({ "options": options })))
    }
}
