//! Static model pricing table and the billing cost rule.
//!
//! The table here is authoritative for billing. Adapter-supplied prices are
//! marketplace-listing metadata only and never feed cost computation.

/// One row of the model price table. Prices are USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingEntry {
    pub model: &'static str,
    pub provider: &'static str,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Authoritative price table. Rows match on exact id first, then on the
/// longest id prefix, so dated snapshots inherit their family price.
pub const PRICING_TABLE: &[PricingEntry] = &[
    entry("gpt-4o-mini", "openai", 0.15, 0.60),
    entry("gpt-4o", "openai", 2.50, 10.00),
    entry("gpt-4.1-nano", "openai", 0.10, 0.40),
    entry("gpt-4.1-mini", "openai", 0.40, 1.60),
    entry("gpt-4.1", "openai", 2.00, 8.00),
    entry("o1-mini", "openai", 1.10, 4.40),
    entry("o1", "openai", 15.00, 60.00),
    entry("o3-mini", "openai", 1.10, 4.40),
    entry("o3", "openai", 2.00, 8.00),
    entry("o4-mini", "openai", 1.10, 4.40),
    entry("claude-3-5-haiku", "anthropic", 0.80, 4.00),
    entry("claude-3-5-sonnet", "anthropic", 3.00, 15.00),
    entry("claude-3-7-sonnet", "anthropic", 3.00, 15.00),
    entry("claude-sonnet-4", "anthropic", 3.00, 15.00),
    entry("claude-opus-4", "anthropic", 15.00, 75.00),
    entry("gemini-1.5-flash", "google", 0.075, 0.30),
    entry("gemini-1.5-pro", "google", 1.25, 5.00),
    entry("gemini-2.0-flash", "google", 0.10, 0.40),
    entry("gemini-2.5-flash", "google", 0.30, 2.50),
    entry("gemini-2.5-pro", "google", 1.25, 10.00),
    entry("deepseek-chat", "deepseek", 0.27, 1.10),
    entry("deepseek-reasoner", "deepseek", 0.55, 2.19),
];

const fn entry(
    model: &'static str,
    provider: &'static str,
    input_per_million: f64,
    output_per_million: f64,
) -> PricingEntry {
    PricingEntry {
        model,
        provider,
        input_per_million,
        output_per_million,
    }
}

/// Finds the price row for a model id; exact match wins over prefix match.
pub fn lookup(model: &str) -> Option<&'static PricingEntry> {
    let lowered = model.trim().to_ascii_lowercase();
    if let Some(exact) = PRICING_TABLE.iter().find(|row| row.model == lowered) {
        return Some(exact);
    }
    PRICING_TABLE
        .iter()
        .filter(|row| lowered.starts_with(row.model))
        .max_by_key(|row| row.model.len())
}

/// Billing cost in USD: `(prompt·input + completion·output) / 1e6`.
///
/// Models absent from the table bill at zero.
pub fn cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    match lookup(model) {
        Some(row) => {
            (prompt_tokens as f64 * row.input_per_million
                + completion_tokens as f64 * row.output_per_million)
                / 1_000_000.0
        }
        None => 0.0,
    }
}

/// Infers the owning provider from the model id prefix.
pub fn infer_provider(model: &str) -> Option<&'static str> {
    let lowered = model.trim().to_ascii_lowercase();
    if lowered.starts_with("gpt-")
        || lowered.starts_with("o1")
        || lowered.starts_with("o3")
        || lowered.starts_with("o4")
    {
        Some("openai")
    } else if lowered.starts_with("claude-") {
        Some("anthropic")
    } else if lowered.starts_with("gemini-") {
        Some("google")
    } else if lowered.starts_with("deepseek-") {
        Some("deepseek")
    } else if lowered.starts_with("openrouter/") {
        Some("openrouter")
    } else {
        None
    }
}
