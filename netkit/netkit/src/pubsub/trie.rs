// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topic trie for subscription routing.
//!
//! Patterns are `/`-separated topics where `*` matches exactly one segment
//! and a terminal `**` matches one or more remaining segments. Publishes
//! take the read side of the enclosing lock and walk the trie
//! segment-by-segment, unioning every matching subscriber set.

use std::collections::{HashMap, HashSet};

pub type SubscriberId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("empty topic or pattern")]
    Empty,
    #[error("empty segment")]
    EmptySegment,
    #[error("`**` is only allowed as the final segment")]
    MultiWildcardNotTerminal,
}

fn segments(topic: &str) -> Result<Vec<&str>, PatternError> {
    if topic.is_empty() {
        return Err(PatternError::Empty);
    }
    let segments: Vec<_> = topic.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(PatternError::EmptySegment);
    }
    Ok(segments)
}

fn validate_pattern(pattern: &str) -> Result<Vec<&str>, PatternError> {
    let segments = segments(pattern)?;
    if segments
        .iter()
        .take(segments.len() - 1)
        .any(|segment| *segment == "**")
    {
        return Err(PatternError::MultiWildcardNotTerminal);
    }
    Ok(segments)
}

/// Standalone pattern match with the same semantics as the trie; used by
/// persistence replay
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let (Ok(pattern), Ok(topic)) = (validate_pattern(pattern), segments(topic)) else {
        return false;
    };

    fn walk(pattern: &[&str], topic: &[&str]) -> bool {
        match (pattern.split_first(), topic.split_first()) {
            (None, None) => true,
            (Some((head, _)), Some(_)) if *head == "**" => true,
            (Some((head, rest)), Some((segment, remaining))) => {
                (*head == "*" || head == segment) && walk(rest, remaining)
            }
            _ => false,
        }
    }

    walk(&pattern, &topic)
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Subtree under a `*` segment
    wildcard: Option<Box<Node>>,
    /// Subscribers whose pattern terminates at this node
    terminal: HashSet<SubscriberId>,
    /// Subscribers with a `**` rooted here
    multi: HashSet<SubscriberId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.wildcard.is_none()
            && self.terminal.is_empty()
            && self.multi.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TopicTrie {
    root: Node,
}

impl TopicTrie {
    pub fn subscribe(&mut self, id: SubscriberId, pattern: &str) -> Result<(), PatternError> {
        let segments = validate_pattern(pattern)?;

        let mut node = &mut self.root;
        for (index, segment) in segments.iter().enumerate() {
            match *segment {
                "**" => {
                    debug_assert_eq!(index, segments.len() - 1);
                    node.multi.insert(id);
                    return Ok(());
                }
                "*" => {
                    node = node.wildcard.get_or_insert_with(Default::default);
                }
                segment => {
                    node = node.children.entry(segment.to_owned()).or_default();
                }
            }
        }

        node.terminal.insert(id);
        Ok(())
    }

    /// Removes one pattern entry; returns whether anything was removed
    pub fn unsubscribe(&mut self, id: SubscriberId, pattern: &str) -> bool {
        let Ok(segments) = validate_pattern(pattern) else {
            return false;
        };
        Self::remove(&mut self.root, id, &segments)
    }

    fn remove(node: &mut Node, id: SubscriberId, segments: &[&str]) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return node.terminal.remove(&id);
        };

        match *head {
            "**" => node.multi.remove(&id),
            "*" => {
                let Some(child) = node.wildcard.as_deref_mut() else {
                    return false;
                };
                let removed = Self::remove(child, id, rest);
                if child.is_empty() {
                    node.wildcard = None;
                }
                removed
            }
            segment => {
                let Some(child) = node.children.get_mut(segment) else {
                    return false;
                };
                let removed = Self::remove(child, id, rest);
                if child.is_empty() {
                    node.children.remove(segment);
                }
                removed
            }
        }
    }

    /// All subscribers whose patterns match `topic`, deduplicated
    pub fn matches(&self, topic: &str) -> HashSet<SubscriberId> {
        let mut out = HashSet::new();
        if let Ok(segments) = segments(topic) {
            Self::collect(&self.root, &segments, &mut out);
        }
        out
    }

    fn collect(node: &Node, segments: &[&str], out: &mut HashSet<SubscriberId>) {
        let Some((head, rest)) = segments.split_first() else {
            out.extend(&node.terminal);
            return;
        };

        // `**` consumes everything that remains
        out.extend(&node.multi);

        if let Some(child) = node.children.get(*head) {
            Self::collect(child, rest, out);
        }
        if let Some(child) = node.wildcard.as_deref() {
            Self::collect(child, rest, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(trie: &TopicTrie, topic: &str) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = trie.matches(topic).into_iter().collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn exact_and_wildcard_matching() {
        let mut trie = TopicTrie::default();
        trie.subscribe(1, "a/b/c").unwrap();
        trie.subscribe(2, "a/*/c").unwrap();
        trie.subscribe(3, "a/**").unwrap();
        trie.subscribe(4, "**").unwrap();
        trie.subscribe(5, "a/b").unwrap();
        trie.subscribe(6, "a/b/c/d").unwrap();
        trie.subscribe(7, "a/x/c").unwrap();
        trie.subscribe(8, "*").unwrap();

        assert_eq!(ids(&trie, "a/b/c"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn single_wildcard_is_one_segment() {
        let mut trie = TopicTrie::default();
        trie.subscribe(1, "news/*").unwrap();

        assert_eq!(ids(&trie, "news/sports"), vec![1]);
        assert!(ids(&trie, "news/x/y").is_empty());
        assert!(ids(&trie, "news").is_empty());
    }

    #[test]
    fn multi_wildcard_requires_at_least_one_segment() {
        let mut trie = TopicTrie::default();
        trie.subscribe(1, "a/**").unwrap();

        assert_eq!(ids(&trie, "a/b"), vec![1]);
        assert_eq!(ids(&trie, "a/b/c/d"), vec![1]);
        assert!(ids(&trie, "a").is_empty());
    }

    #[test]
    fn duplicate_matches_are_deduplicated() {
        let mut trie = TopicTrie::default();
        trie.subscribe(1, "a/b").unwrap();
        trie.subscribe(1, "a/*").unwrap();
        trie.subscribe(1, "**").unwrap();

        assert_eq!(ids(&trie, "a/b"), vec![1]);
    }

    #[test]
    fn unsubscribe_prunes_empty_branches() {
        let mut trie = TopicTrie::default();
        trie.subscribe(1, "deep/ly/nested/topic").unwrap();
        assert!(trie.unsubscribe(1, "deep/ly/nested/topic"));
        assert!(!trie.unsubscribe(1, "deep/ly/nested/topic"));
        assert!(trie.root.is_empty());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let mut trie = TopicTrie::default();
        assert_eq!(trie.subscribe(1, ""), Err(PatternError::Empty));
        assert_eq!(trie.subscribe(1, "a//b"), Err(PatternError::EmptySegment));
        assert_eq!(
            trie.subscribe(1, "a/**/b"),
            Err(PatternError::MultiWildcardNotTerminal)
        );
    }

    #[test]
    fn standalone_matcher_agrees_with_the_trie() {
        for (pattern, topic, expected) in [
            ("a/b/c", "a/b/c", true),
            ("a/*/c", "a/b/c", true),
            ("a/**", "a/b/c", true),
            ("**", "a/b/c", true),
            ("a/b", "a/b/c", false),
            ("a/b/c/d", "a/b/c", false),
            ("a/x/c", "a/b/c", false),
            ("*", "a/b/c", false),
        ] {
            assert_eq!(
                pattern_matches(pattern, topic),
                expected,
                "{pattern} vs {topic}"
            );
        }
    }
}
