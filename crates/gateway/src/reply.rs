use serde::Serialize;

/// Longest message the platform accepts in one send.
pub const MESSAGE_LIMIT: usize = 2_000;
/// Chunk length used once a reply exceeds [`MESSAGE_LIMIT`].
pub const CHUNK_SIZE: usize = 1_900;
/// Reaction attached to every bot reply; reacting with it asks for deletion.
pub const DELETE_REACTION: &str = "🗑️";

pub const HELP_TITLE: &str = "📜 Tàng Kinh Các";
pub const HELP_COLOR: u32 = 0xA6_2019;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    pub fields: Vec<EmbedField>,
}

pub struct EmbedBuilder {
    title: String,
    description: Option<String>,
    color: u32,
    fields: Vec<EmbedField>,
}

impl EmbedBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), description: None, color: 0, fields: Vec::new() }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField { name: name.into(), value: value.into(), inline });
        self
    }

    pub fn build(self) -> Embed {
        Embed {
            title: self.title,
            description: self.description,
            color: self.color,
            fields: self.fields,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Text { content: String },
    Embed { embed: Embed },
}

impl ReplyBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text { content: content.into() }
    }

    /// Plain-text rendering, used for logs and transports without embeds.
    pub fn fallback_text(&self) -> String {
        match self {
            Self::Text { content } => content.clone(),
            Self::Embed { embed } => {
                let mut lines = vec![embed.title.clone()];
                lines.extend(embed.fields.iter().map(|field| format!("{}: {}", field.name, field.value)));
                lines.join("\n")
            }
        }
    }
}

/// Something the transport must do on the bot's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        channel_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        content: String,
        reactions: Vec<String>,
    },
    RespondToCommand {
        interaction_id: String,
        body: ReplyBody,
        ephemeral: bool,
    },
    DeleteMessage {
        channel_id: String,
        message_id: String,
    },
}

/// Splits a reply that does not fit one message into [`CHUNK_SIZE`]-char
/// pieces. Splits land on char boundaries, never inside a code point.
pub fn chunk_reply(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= MESSAGE_LIMIT {
        return vec![text.to_owned()];
    }

    let chars = text.chars().collect::<Vec<_>>();
    chars.chunks(CHUNK_SIZE).map(|chunk| chunk.iter().collect()).collect()
}

/// One send per chunk, each carrying the delete reaction.
pub fn bot_reply_actions(channel_id: &str, text: &str) -> Vec<OutboundAction> {
    chunk_reply(text)
        .into_iter()
        .map(|content| OutboundAction::SendMessage {
            channel_id: channel_id.to_owned(),
            reply_to: None,
            content,
            reactions: vec![DELETE_REACTION.to_owned()],
        })
        .collect()
}

pub fn channel_notice(channel_id: &str, text: impl Into<String>) -> OutboundAction {
    OutboundAction::SendMessage {
        channel_id: channel_id.to_owned(),
        reply_to: None,
        content: text.into(),
        reactions: Vec::new(),
    }
}

pub fn reply_notice(channel_id: &str, message_id: &str, text: impl Into<String>) -> OutboundAction {
    OutboundAction::SendMessage {
        channel_id: channel_id.to_owned(),
        reply_to: Some(message_id.to_owned()),
        content: text.into(),
        reactions: Vec::new(),
    }
}

pub fn ephemeral_response(interaction_id: &str, body: ReplyBody) -> OutboundAction {
    OutboundAction::RespondToCommand {
        interaction_id: interaction_id.to_owned(),
        body,
        ephemeral: true,
    }
}

pub fn help_embed(target_channels: &[String]) -> Embed {
    EmbedBuilder::new(HELP_TITLE)
        .description("Hướng dẫn sử dụng")
        .color(HELP_COLOR)
        .field("Hoạt động tại", target_channels.join(", "), false)
        .field("Lệnh", "`/help`, `/reset`, `/set-persona`", false)
        .build()
}
