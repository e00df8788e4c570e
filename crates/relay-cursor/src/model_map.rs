//! Gateway-model → Cursor-model id mapping.
//!
//! This is configuration, not logic: rows mirror what the Cursor web client
//! currently advertises, including ids we cannot independently verify
//! upstream. Unknown models pass through unchanged.

use relay_provider::ModelInfo;

/// `(gateway id, cursor id)` rows.
pub const CURSOR_MODEL_MAP: &[(&str, &str)] = &[
    ("gpt-4o", "gpt-4o"),
    ("gpt-4o-mini", "gpt-4o-mini"),
    ("gpt-4.1", "gpt-4.1"),
    ("gpt-5.2", "gpt-5.2"),
    ("gpt-5.2-codex", "gpt-5.2-codex"),
    ("gpt-5.1-codex", "gpt-5.1-codex"),
    ("o3", "o3"),
    ("o4-mini", "o4-mini"),
    ("claude-3-5-sonnet", "claude-3.5-sonnet"),
    ("claude-3-7-sonnet", "claude-3.7-sonnet"),
    ("claude-sonnet-4", "claude-4-sonnet"),
    ("claude-opus-4", "claude-4-opus"),
    ("gemini-2.5-pro", "gemini-2.5-pro"),
    ("deepseek-chat", "deepseek-v3"),
];

/// Maps a gateway model id to the Cursor wire id.
pub fn map_cursor_model(model: &str) -> &str {
    CURSOR_MODEL_MAP
        .iter()
        .find(|(gateway_id, _)| *gateway_id == model)
        .map(|(_, cursor_id)| *cursor_id)
        .unwrap_or(model)
}

/// Marketplace listing for the Cursor transport.
///
/// Prices come from the central table where a row exists; billing never uses
/// anything else.
pub fn cursor_model_listing() -> Vec<ModelInfo> {
    CURSOR_MODEL_MAP
        .iter()
        .map(|(gateway_id, _)| {
            let mut info = ModelInfo::new(*gateway_id, "cursor");
            if let Some(row) = relay_pricing::lookup(gateway_id) {
                info.input_price_per_million = Some(row.input_per_million);
                info.output_price_per_million = Some(row.output_per_million);
            }
            info
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_mapped_ids_translate_and_unknown_ids_pass_through() {
        assert_eq!(map_cursor_model("claude-3-5-sonnet"), "claude-3.5-sonnet");
        assert_eq!(map_cursor_model("gpt-5.2"), "gpt-5.2");
        assert_eq!(map_cursor_model("never-heard-of-it"), "never-heard-of-it");
    }

    #[test]
    fn listing_prices_come_from_the_central_table() {
        let listing = cursor_model_listing();
        let sonnet = listing
            .iter()
            .find(|row| row.id == "claude-3-5-sonnet")
            .expect("row");
        assert_eq!(sonnet.input_price_per_million, Some(3.0));
        // Rows the central table does not price stay unpriced.
        let codex = listing.iter().find(|row| row.id == "gpt-5.2-codex").expect("row");
        assert_eq!(codex.input_price_per_million, None);
    }
}
