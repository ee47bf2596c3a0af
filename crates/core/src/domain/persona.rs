use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

pub const DEFAULT_PERSONA_KEY: &str = "tieu_thu_dong";

const TIEU_THU_DONG_SYSTEM: &str = "Bạn là 'Tiểu Thư Đồng', NPC hướng dẫn game Where Winds Meet (Yến Vân Thập Lục Thanh).

QUY TẮC:
1. Xưng hô: Tại hạ / Đại hiệp.
2. Giọng điệu: Cổ trang, kiếm hiệp, ngắn gọn, súc tích.
3. Kiến thức game: Trong game Where Winds Meet, người chơi KHÔNG thể tặng quà cho NPC. Nếu được hỏi về việc tặng quà, hãy khẳng định là không có tính năng này.";

/// Canned replies used when no generated text is available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackMessages {
    /// Every candidate model and retry failed.
    pub unavailable: String,
    /// The circuit breaker is open.
    pub overloaded: String,
    /// No completion credentials were configured.
    pub unconfigured: String,
    /// Anything else went wrong inside the reply pipeline.
    pub unexpected: String,
}

impl Default for FallbackMessages {
    fn default() -> Self {
        Self {
            unavailable: "⚠️ Hệ thống AI đang bảo trì (Lỗi kết nối API). Vui lòng thử lại sau."
                .to_string(),
            overloaded:
                "🍵 Tại hạ đang tĩnh tọa điều tức, Đại hiệp vui lòng quay lại sau giây lát."
                    .to_string(),
            unconfigured: "Chưa cấu hình API Key hoặc Key lỗi.".to_string(),
            unexpected: "⚠️ Lỗi không xác định. Xin hãy thử lại sau.".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaDefinition {
    pub key: String,
    pub name: String,
    pub system_instruction: String,
    pub fallbacks: FallbackMessages,
}

impl PersonaDefinition {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        system_instruction: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            system_instruction: system_instruction.into(),
            fallbacks: FallbackMessages::default(),
        }
    }

    pub fn tieu_thu_dong() -> Self {
        Self::new(DEFAULT_PERSONA_KEY, "Tiểu Thư Đồng", TIEU_THU_DONG_SYSTEM)
    }
}

/// Immutable set of personas loaded at startup, with a default used for users
/// that never picked one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonaCatalog {
    personas: BTreeMap<String, PersonaDefinition>,
    default_persona: PersonaDefinition,
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        let persona = PersonaDefinition::tieu_thu_dong();
        Self {
            personas: BTreeMap::from([(persona.key.clone(), persona.clone())]),
            default_persona: persona,
        }
    }
}

impl PersonaCatalog {
    pub fn new(
        personas: impl IntoIterator<Item = PersonaDefinition>,
        default_key: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let personas = personas
            .into_iter()
            .map(|persona| (persona.key.clone(), persona))
            .collect::<BTreeMap<_, _>>();
        let default_key = default_key.into();

        let Some(default_persona) = personas.get(&default_key).cloned() else {
            return Err(DomainError::UnknownPersona(default_key));
        };

        Ok(Self { personas, default_persona })
    }

    pub fn get(&self, key: &str) -> Option<&PersonaDefinition> {
        self.personas.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.personas.contains_key(key)
    }

    pub fn default_persona(&self) -> &PersonaDefinition {
        &self.default_persona
    }

    /// Unknown or missing keys fall back to the default persona.
    pub fn resolve(&self, key: Option<&str>) -> &PersonaDefinition {
        key.and_then(|key| self.personas.get(key)).unwrap_or_else(|| self.default_persona())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.personas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{PersonaCatalog, PersonaDefinition, DEFAULT_PERSONA_KEY};
    use crate::errors::DomainError;

    #[test]
    fn default_catalog_contains_builtin_persona() {
        let catalog = PersonaCatalog::default();
        let persona = catalog.default_persona();

        assert_eq!(persona.key, DEFAULT_PERSONA_KEY);
        assert!(persona.system_instruction.contains("Tại hạ / Đại hiệp"));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn unknown_key_resolves_to_default_persona() {
        let catalog = PersonaCatalog::new(
            [
                PersonaDefinition::tieu_thu_dong(),
                PersonaDefinition::new("kiem_khach", "Kiếm Khách", "Bạn là một kiếm khách."),
            ],
            DEFAULT_PERSONA_KEY,
        )
        .expect("catalog");

        assert_eq!(catalog.resolve(Some("kiem_khach")).name, "Kiếm Khách");
        assert_eq!(catalog.resolve(Some("missing")).key, DEFAULT_PERSONA_KEY);
        assert_eq!(catalog.resolve(None).key, DEFAULT_PERSONA_KEY);
    }

    #[test]
    fn catalog_rejects_missing_default() {
        let error = PersonaCatalog::new([PersonaDefinition::tieu_thu_dong()], "ghost")
            .expect_err("default must exist");
        assert_eq!(error, DomainError::UnknownPersona("ghost".to_string()));
    }
}
