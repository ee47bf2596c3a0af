use std::collections::BTreeMap;

use ekko_core::domain::conversation::{ConversationTurn, ParticipantRole};

use crate::llm::{ImageBlob, PromptPart};

const SYSTEM_LABEL: &str = "HƯỚNG DẪN HỆ THỐNG";
const HISTORY_LABEL: &str = "LỊCH SỬ HỘI THOẠI";
const USER_LABEL: &str = "NGƯỜI DÙNG";
const TRUNCATION_MARK: char = '…';

/// Everything sent to the completion service for one reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub images: Vec<ImageBlob>,
}

impl CompletionRequest {
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// Prompt text first, then images in attachment order.
    pub fn parts(&self) -> Vec<PromptPart> {
        std::iter::once(PromptPart::Text(self.prompt.clone()))
            .chain(self.images.iter().cloned().map(PromptPart::Image))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct PromptBuilder {
    history_window: usize,
    max_turn_chars: usize,
    persona_names: BTreeMap<String, String>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(6, 600)
    }
}

impl PromptBuilder {
    pub fn new(history_window: usize, max_turn_chars: usize) -> Self {
        Self {
            history_window,
            max_turn_chars: max_turn_chars.max(1),
            persona_names: BTreeMap::new(),
        }
    }

    /// Display names keyed by persona key, used to label stored assistant turns
    /// with the persona that actually spoke them.
    pub fn with_persona_names(mut self, names: BTreeMap<String, String>) -> Self {
        self.persona_names = names;
        self
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Renders system instructions, the newest `history_window` turns and the
    /// current request, in that order. Historical turns are clipped to
    /// `max_turn_chars`; the current request is appended exactly as given.
    /// Assistant turns from a persona without a known name fall back to
    /// `assistant_name`.
    pub fn build(
        &self,
        system_text: &str,
        assistant_name: &str,
        history: &[ConversationTurn],
        user_text: &str,
    ) -> String {
        let mut prompt = format!("{SYSTEM_LABEL}: {}", system_text.trim());

        let start = history.len().saturating_sub(self.history_window);
        let window = &history[start..];
        if !window.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(HISTORY_LABEL);
            prompt.push(':');
            for turn in window {
                let label = match turn.role {
                    ParticipantRole::User => USER_LABEL,
                    ParticipantRole::Assistant => self
                        .persona_names
                        .get(&turn.persona_label)
                        .map(String::as_str)
                        .unwrap_or(assistant_name),
                };
                prompt.push('\n');
                prompt.push_str(label);
                prompt.push_str(": ");
                prompt.push_str(&clip(turn.text.trim(), self.max_turn_chars));
            }
        }

        prompt.push_str("\n\n");
        prompt.push_str(USER_LABEL);
        prompt.push_str(": ");
        prompt.push_str(user_text);
        prompt
    }

    pub fn request(
        &self,
        system_text: &str,
        assistant_name: &str,
        history: &[ConversationTurn],
        user_text: &str,
        images: Vec<ImageBlob>,
    ) -> CompletionRequest {
        CompletionRequest {
            prompt: self.build(system_text, assistant_name, history, user_text),
            images,
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut clipped = text[..cut].to_string();
            clipped.push(TRUNCATION_MARK);
            clipped
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ekko_core::domain::conversation::ConversationTurn;

    use super::{CompletionRequest, PromptBuilder};
    use crate::llm::{ImageBlob, PromptPart};

    #[test]
    fn empty_history_renders_system_and_request_only() {
        let prompt = PromptBuilder::default().build("Bạn là NPC.", "Tiểu Thư Đồng", &[], "Xin chào");

        assert_eq!(prompt, "HƯỚNG DẪN HỆ THỐNG: Bạn là NPC.\n\nNGƯỜI DÙNG: Xin chào");
    }

    #[test]
    fn history_uses_role_labels_and_persona_name() {
        let history = vec![
            ConversationTurn::user("tieu_thu_dong", "Tặng quà được không?"),
            ConversationTurn::assistant("tieu_thu_dong", "Không có tính năng này."),
        ];
        let prompt = PromptBuilder::default().build("sys", "Tiểu Thư Đồng", &history, "Vì sao?");

        assert_eq!(
            prompt,
            "HƯỚNG DẪN HỆ THỐNG: sys\n\nLỊCH SỬ HỘI THOẠI:\nNGƯỜI DÙNG: Tặng quà được không?\n\
             Tiểu Thư Đồng: Không có tính năng này.\n\nNGƯỜI DÙNG: Vì sao?"
        );
    }

    #[test]
    fn only_newest_turns_inside_window_are_rendered() {
        let history: Vec<ConversationTurn> =
            (0..10).map(|index| ConversationTurn::user("p", format!("lượt {index}"))).collect();
        let prompt = PromptBuilder::new(3, 600).build("sys", "Bot", &history, "mới");

        assert!(!prompt.contains("lượt 6"));
        assert!(prompt.contains("lượt 7"));
        assert!(prompt.contains("lượt 9"));
        assert_eq!(prompt.matches("NGƯỜI DÙNG:").count(), 4);
    }

    #[test]
    fn zero_window_omits_history_section() {
        let history = vec![ConversationTurn::user("p", "cũ")];
        let prompt = PromptBuilder::new(0, 600).build("sys", "Bot", &history, "mới");

        assert!(!prompt.contains("LỊCH SỬ"));
        assert!(prompt.ends_with("NGƯỜI DÙNG: mới"));
    }

    #[test]
    fn long_history_turns_are_clipped_on_char_boundaries_but_request_is_not() {
        let history = vec![ConversationTurn::assistant("p", "ữ".repeat(20))];
        let request = "ạ".repeat(50);
        let prompt = PromptBuilder::new(6, 5).build("sys", "Bot", &history, &request);

        assert!(prompt.contains(&format!("Bot: {}…", "ữ".repeat(5))));
        assert!(prompt.ends_with(&request));
    }

    #[test]
    fn request_parts_put_text_before_images() {
        let request = CompletionRequest {
            prompt: "p".to_string(),
            images: vec![ImageBlob::png(vec![1]), ImageBlob::new("image/jpeg", vec![2])],
        };

        let parts = request.parts();
        assert!(request.has_images());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], PromptPart::Text("p".to_string()));
        assert!(matches!(&parts[2], PromptPart::Image(image) if image.mime_type == "image/jpeg"));
    }

    #[test]
    fn request_text_is_appended_verbatim() {
        let builder = PromptBuilder::default();

        assert!(builder.build("sys", "Bot", &[], "Xin chào ").ends_with("NGƯỜI DÙNG: Xin chào "));
        assert!(builder.build("sys", "Bot", &[], "dòng 1\n").ends_with("NGƯỜI DÙNG: dòng 1\n"));
    }

    #[test]
    fn assistant_turns_are_labelled_by_the_persona_that_spoke() {
        let names = BTreeMap::from([
            ("tieu_thu_dong".to_string(), "Tiểu Thư Đồng".to_string()),
            ("kiem_khach".to_string(), "Kiếm Khách".to_string()),
        ]);
        let history = vec![
            ConversationTurn::assistant("kiem_khach", "Kiếm pháp vô song."),
            ConversationTurn::assistant("tieu_thu_dong", "Tại hạ đã đổi vai."),
            ConversationTurn::assistant("da_xoa", "Vai cũ."),
        ];
        let prompt = PromptBuilder::default().with_persona_names(names).build(
            "sys",
            "Tiểu Thư Đồng",
            &history,
            "Ai vừa nói?",
        );

        assert!(prompt.contains("\nKiếm Khách: Kiếm pháp vô song.\n"));
        assert!(prompt.contains("\nTiểu Thư Đồng: Tại hạ đã đổi vai.\n"));
        assert!(prompt.contains("\nTiểu Thư Đồng: Vai cũ.\n"));
    }
}
