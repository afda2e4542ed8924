use std::collections::BTreeMap;
use std::time::Duration;

use crate::color::{clean_input, ColorError, ColorTable, PaletteBook, Resolution};
use crate::config::{categories, Config};
use crate::device::LampTarget;
use crate::model::NotificationEvent;
use crate::queue::LampCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub message: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    pub commands: Vec<LampCommand>,
    pub replies: Vec<ChatReply>,
}

impl Routed {
    fn command(command: LampCommand) -> Self {
        Self {
            commands: vec![command],
            replies: Vec::new(),
        }
    }

    fn with_reply(mut self, reply: Option<ChatReply>) -> Self {
        self.replies.extend(reply);
        self
    }
}

pub struct Router {
    rewards: BTreeMap<String, String>,
    colors: ColorTable,
    palettes: PaletteBook,
    event_palettes: BTreeMap<String, String>,
    effect_duration: Duration,
    chat_lamp: String,
    max_command_chars: usize,
    invalid_color_reply: String,
    invalid_effect_reply: String,
    dev_mode: bool,
}

impl Router {
    pub fn from_config(config: &Config, dev_mode: bool) -> Result<Self, ColorError> {
        Ok(Self {
            rewards: config.rewards.clone(),
            colors: ColorTable::new(&config.colors)?,
            palettes: PaletteBook::from_config(&config.effects)?,
            event_palettes: config.effects.events.clone(),
            effect_duration: Duration::from_millis(config.effects.duration_ms),
            chat_lamp: config.chat.lamp.clone(),
            max_command_chars: config.chat.max_command_chars,
            invalid_color_reply: config.chat.invalid_color_reply.clone(),
            invalid_effect_reply: config.chat.invalid_effect_reply.clone(),
            dev_mode,
        })
    }

    pub fn route(&self, event: &NotificationEvent) -> Routed {
        match event {
            NotificationEvent::RewardRedemption(redemption) => {
                let title = redemption.reward.title.as_str();
                match self.rewards.get(title) {
                    Some(lamp) => {
                        self.color_command(lamp, &redemption.user_input, &redemption.user_name)
                    }
                    None => {
                        tracing::info!(reward = %title, user = %redemption.user_name, "unmapped reward title");
                        Routed::default()
                    }
                }
            }
            NotificationEvent::ChatMessage(chat) => {
                self.chat_command(&chat.message.text, &chat.chatter_user_name)
            }
            NotificationEvent::Subscribe(sub) => {
                tracing::info!(user = %sub.user_name, tier = %sub.tier, gift = sub.is_gift, "new subscriber");
                self.celebrate(categories::SUBSCRIBE)
            }
            NotificationEvent::SubscriptionGift(gift) => {
                tracing::info!(
                    user = display_name(gift.user_name.as_deref(), gift.is_anonymous),
                    total = gift.total,
                    "subscriptions gifted"
                );
                self.celebrate(categories::SUBSCRIPTION_GIFT)
            }
            NotificationEvent::SubscriptionMessage(resub) => {
                tracing::info!(user = %resub.user_name, months = resub.cumulative_months, "resubscription");
                self.celebrate(categories::SUBSCRIPTION_MESSAGE)
            }
            NotificationEvent::Cheer(cheer) => {
                tracing::info!(
                    user = display_name(cheer.user_name.as_deref(), cheer.is_anonymous),
                    bits = cheer.bits,
                    "cheer"
                );
                self.celebrate(categories::CHEER)
            }
            NotificationEvent::StreamOnline(status) => {
                tracing::info!(broadcaster = %status.broadcaster_user_name, "stream went live");
                Routed::default()
            }
            NotificationEvent::StreamOffline(status) => {
                tracing::info!(broadcaster = %status.broadcaster_user_name, "stream went offline");
                Routed::default()
            }
        }
    }

    fn color_command(&self, lamp: &str, raw_input: &str, user: &str) -> Routed {
        let input = clean_input(raw_input);
        let (color, how) = self.colors.resolve(&input);
        if how == Resolution::Fallback {
            tracing::debug!(input = %input, known = ?self.colors.names().collect::<Vec<_>>(), "color not recognised, using random");
        }
        let reply = (how == Resolution::Fallback)
            .then(|| self.reply(&self.invalid_color_reply, user, &input));
        tracing::info!(lamp, user, input = %input, color = %color, "color requested");
        Routed::command(LampCommand::SetColor {
            lamp: lamp.to_string(),
            color,
        })
        .with_reply(reply)
    }

    fn celebrate(&self, category: &str) -> Routed {
        let Some(palette_name) = self.event_palettes.get(category) else {
            tracing::debug!(category, "no palette mapped for event");
            return Routed::default();
        };
        let palette = self
            .palettes
            .get(palette_name)
            .unwrap_or_else(|| self.palettes.default_palette())
            .clone();
        Routed::command(LampCommand::RunEffect {
            target: LampTarget::All,
            palette,
            duration: self.effect_duration,
        })
    }

    fn chat_command(&self, text: &str, user: &str) -> Routed {
        if !self.dev_mode || text.chars().count() >= self.max_command_chars {
            return Routed::default();
        }
        let mut tokens = text.split_whitespace();
        let (Some(verb), Some(arg)) = (tokens.next(), tokens.next()) else {
            return Routed::default();
        };

        match verb {
            "color" => self.color_command(&self.chat_lamp, arg, user),
            "effect" => {
                let name = arg.to_lowercase();
                let (palette, reply) = match self.palettes.get(&name) {
                    Some(palette) => (palette.clone(), None),
                    None => {
                        tracing::info!(effect = %name, available = ?self.palettes.names().collect::<Vec<_>>(), "unknown effect requested");
                        (
                            self.palettes.default_palette().clone(),
                            Some(self.reply(&self.invalid_effect_reply, user, &name)),
                        )
                    }
                };
                Routed::command(LampCommand::RunEffect {
                    target: LampTarget::Lamp(self.chat_lamp.clone()),
                    palette,
                    duration: self.effect_duration,
                })
                .with_reply(reply)
            }
            _ => Routed::default(),
        }
    }

    fn reply(&self, template: &str, user: &str, input: &str) -> ChatReply {
        ChatReply {
            message: template.replace("{user}", user).replace("{input}", input),
        }
    }
}

fn display_name(user_name: Option<&str>, anonymous: bool) -> &str {
    match user_name {
        Some(name) if !anonymous && !name.is_empty() => name,
        _ => "anonymous",
    }
}
