//! Static free-model catalogue for the marketplace listing.
//!
//! Purely presentational: routing never consults this list.

use crate::types::ModelInfo;

const FREE_MODEL_IDS: &[(&str, &str)] = &[
    ("gpt-4o-mini", "openai"),
    ("deepseek-chat", "deepseek"),
    ("gemini-2.0-flash", "google"),
    ("claude-3-5-haiku", "anthropic"),
];

/// Returns the free tier rows appended to `GET /v1/models`.
pub fn free_model_catalog() -> Vec<ModelInfo> {
    FREE_MODEL_IDS
        .iter()
        .map(|(id, provider)| {
            let mut info = ModelInfo::new(*id, *provider);
            info.free = true;
            info.input_price_per_million = Some(0.0);
            info.output_price_per_million = Some(0.0);
            info
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_rows_are_flagged_and_zero_priced() {
        let catalog = free_model_catalog();
        assert!(!catalog.is_empty());
        assert!(catalog.iter().all(|row| row.free));
        assert!(catalog
            .iter()
            .all(|row| row.input_price_per_million == Some(0.0)));
    }
}
