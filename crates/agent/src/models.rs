/// Cost tier inferred from a model identifier. Lower tiers are tried first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelTier {
    Lite,
    Flash,
    Pro,
    Other,
}

impl ModelTier {
    pub fn of(model: &str) -> Self {
        let model = model.to_ascii_lowercase();
        if model.contains("lite") {
            Self::Lite
        } else if model.contains("flash") {
            Self::Flash
        } else if model.contains("pro") {
            Self::Pro
        } else {
            Self::Other
        }
    }
}

/// Static candidate lists, ordered cheapest tier first. Within a tier the
/// configured order is kept.
#[derive(Clone, Debug)]
pub struct ModelSelector {
    text_models: Vec<String>,
    vision_models: Vec<String>,
}

impl ModelSelector {
    pub fn new(text_models: Vec<String>, vision_models: Vec<String>) -> Self {
        Self { text_models: by_tier(text_models), vision_models: by_tier(vision_models) }
    }

    /// Image requests only ever get vision-capable identifiers.
    pub fn select_candidates(&self, has_images: bool) -> Vec<String> {
        if has_images {
            self.vision_models.clone()
        } else {
            self.text_models.clone()
        }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(
            vec![
                "gemini-2.0-flash".to_string(),
                "gemini-1.5-flash".to_string(),
                "gemini-1.5-pro".to_string(),
            ],
            vec!["gemini-2.0-flash".to_string(), "gemini-1.5-pro".to_string()],
        )
    }
}

fn by_tier(models: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(models.len());
    for model in models {
        let model = model.trim().to_string();
        if !model.is_empty() && !unique.contains(&model) {
            unique.push(model);
        }
    }
    unique.sort_by_key(|model| ModelTier::of(model));
    unique
}
