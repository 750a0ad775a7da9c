//! Token estimation and batch packing. The estimate is the usual
//! chars/4 approximation; objects count as their JSON encoding.

use serde::Serialize;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_json_tokens<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value)
        .map(|encoded| estimate_tokens(&encoded))
        .unwrap_or(0)
}

/// Greedy single-pass packing. A batch closes when adding the next
/// item would break either cap; an item already over the token cap
/// travels alone. Input order is preserved across batches.
pub fn create_batches<T: Serialize>(
    items: Vec<T>,
    max_tokens_per_batch: usize,
    max_items_per_batch: usize,
) -> Vec<Vec<T>> {
    let max_items = max_items_per_batch.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let item_tokens = estimate_json_tokens(&item);
        let would_overflow =
            current.len() >= max_items || current_tokens + item_tokens > max_tokens_per_batch;
        if would_overflow && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += item_tokens;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Prices are per 1000 tokens.
pub fn estimate_cost(
    prompt_tokens: u64,
    completion_tokens: u64,
    input_cost_per_1k: f64,
    output_cost_per_1k: f64,
) -> f64 {
    (prompt_tokens as f64 / 1000.0) * input_cost_per_1k
        + (completion_tokens as f64 / 1000.0) * output_cost_per_1k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_ceil_len_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn test_object_estimate_uses_json_encoding() {
        // "hi" encodes as "\"hi\"": 4 chars, 1 token.
        assert_eq!(estimate_json_tokens(&"hi"), 1);
        assert_eq!(
            estimate_json_tokens(&serde_json::json!({"a": 1})),
            estimate_tokens("{\"a\":1}")
        );
    }

    /// A 158-char string JSON-encodes to 160 chars = 40 tokens.
    fn forty_token_item() -> String {
        "m".repeat(158)
    }

    #[test]
    fn test_batch_packing_token_cap_first() {
        let items: Vec<String> = (0..250).map(|_| forty_token_item()).collect();
        let batches = create_batches(items, 1000, 50);
        // 25 * 40 = 1000 tokens exactly; the 26th would overflow.
        assert_eq!(batches.len(), 10);
        assert!(batches.iter().all(|batch| batch.len() == 25));
    }

    #[test]
    fn test_batch_packing_count_cap() {
        let items: Vec<String> = (0..7).map(|i| format!("item-{i}")).collect();
        let batches = create_batches(items.clone(), 100_000, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 1);
        // Concatenation equals the input in order.
        let rejoined: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(rejoined, items);
    }

    #[test]
    fn test_oversized_item_travels_alone() {
        let items = vec![
            "small".to_string(),
            "y".repeat(10_000),
            "small2".to_string(),
        ];
        let batches = create_batches(items, 100, 50);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].chars().count(), 10_000);
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let batches = create_batches(Vec::<String>::new(), 100, 10);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_cost_estimate() {
        let cost = estimate_cost(2000, 1000, 0.5, 1.5);
        assert!((cost - 2.5).abs() < 1e-9);
    }
}
