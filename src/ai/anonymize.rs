//! Session-scoped anonymization: usernames map to stable aliases
//! before anything is sent to the LLM. Aliases are prompt-local; a
//! fresh mapper per batch is expected and fine.

use std::collections::HashMap;

use super::PromptMessage;

/// Allocates `User_A … User_Z, User_A1, User_B1, …` per novel
/// username. Deterministic within one instance.
#[derive(Debug, Default)]
pub struct Anonymizer {
    aliases: HashMap<String, String>,
    next: usize,
}

impl Anonymizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias_for(&mut self, username: &str) -> String {
        if let Some(alias) = self.aliases.get(username) {
            return alias.clone();
        }
        let alias = Self::alias_at(self.next);
        self.next += 1;
        self.aliases.insert(username.to_string(), alias.clone());
        alias
    }

    fn alias_at(index: usize) -> String {
        let letter = (b'A' + (index % 26) as u8) as char;
        let round = index / 26;
        if round == 0 {
            format!("User_{letter}")
        } else {
            format!("User_{letter}{round}")
        }
    }

    pub fn reset(&mut self) {
        self.aliases.clear();
        self.next = 0;
    }

    pub fn mappings(&self) -> &HashMap<String, String> {
        &self.aliases
    }
}

/// Anonymize a batch in place: author fields become aliases, author
/// ids collapse to `anon_<last4>`, and, when `anonymize_content` is
/// set, `@name` mentions in content rewrite through the same mapping.
/// Message ids are never touched.
pub fn anonymize_messages(items: &mut [PromptMessage], anonymize_content: bool) -> Anonymizer {
    let mut mapper = Anonymizer::new();

    // First pass pins every author's alias so cross-references in
    // content resolve consistently.
    for item in items.iter_mut() {
        let alias = mapper.alias_for(&item.author);
        item.author_id = anon_id(&item.author_id);
        item.author = alias.clone();
        if item.author_global_name.is_some() {
            item.author_global_name = Some(alias);
        }
    }

    if anonymize_content {
        let mappings: Vec<(String, String)> = mapper
            .mappings()
            .iter()
            .map(|(name, alias)| (format!("@{name}"), format!("@{alias}")))
            .collect();
        for item in items.iter_mut() {
            for (mention, replacement) in &mappings {
                item.content = item.content.replace(mention, replacement);
            }
        }
    }

    mapper
}

fn anon_id(id: &str) -> String {
    let tail: String = id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("anon_{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, author: &str, content: &str) -> PromptMessage {
        PromptMessage {
            id: id.to_string(),
            author: author.to_string(),
            author_global_name: None,
            author_id: format!("9000{id}"),
            content: content.to_string(),
            timestamp: "2024-06-15T10:00:00.000Z".to_string(),
            reaction_count: None,
            has_embeds: None,
            has_attachments: None,
        }
    }

    #[test]
    fn test_alias_sequence_rolls_over_after_z() {
        let mut mapper = Anonymizer::new();
        assert_eq!(mapper.alias_for("u0"), "User_A");
        assert_eq!(mapper.alias_for("u1"), "User_B");
        for i in 2..26 {
            mapper.alias_for(&format!("u{i}"));
        }
        assert_eq!(mapper.alias_for("u26"), "User_A1");
        assert_eq!(mapper.alias_for("u27"), "User_B1");
    }

    #[test]
    fn test_same_name_same_alias_distinct_names_distinct() {
        let mut mapper = Anonymizer::new();
        let a1 = mapper.alias_for("alice");
        let b = mapper.alias_for("bob");
        let a2 = mapper.alias_for("alice");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut mapper = Anonymizer::new();
        mapper.alias_for("alice");
        mapper.reset();
        assert_eq!(mapper.alias_for("bob"), "User_A");
    }

    #[test]
    fn test_batch_anonymization_stability() {
        let mut items = vec![
            item("1", "alice", "hello"),
            item("2", "bob", "hi @alice"),
            item("3", "alice", "again"),
        ];
        anonymize_messages(&mut items, true);

        assert_eq!(items[0].author, "User_A");
        assert_eq!(items[1].author, "User_B");
        // Repeat author keeps the same alias.
        assert_eq!(items[2].author, "User_A");
        // Mentions rewrite through the same mapping.
        assert_eq!(items[1].content, "hi @User_A");
    }

    #[test]
    fn test_ids_rewritten_but_message_ids_preserved() {
        let mut items = vec![item("1", "alice", "hello")];
        anonymize_messages(&mut items, false);

        assert_eq!(items[0].id, "1");
        assert_eq!(items[0].author_id, "anon_0001");
    }

    #[test]
    fn test_global_name_takes_alias_too() {
        let mut items = vec![PromptMessage {
            author_global_name: Some("Alice Liddell".to_string()),
            ..item("1", "alice", "hello")
        }];
        anonymize_messages(&mut items, false);
        assert_eq!(items[0].author_global_name.as_deref(), Some("User_A"));
    }
}
