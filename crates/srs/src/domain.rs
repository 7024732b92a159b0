//! A case-insensitive, right-to-left domain trie: one 37-way branch per
//! label character (`A-Z`, `0-9`, `-`), plus one extra "label boundary"
//! branch walked once between labels. Domains are inserted and looked up
//! rightmost-label-first, so `example.com` and `mail.example.com` share the
//! same `com` / `example` path and only diverge at the leftmost label.
//!
//! Kept as an owned arena (`Vec<Node>` with index-based children) rather
//! than 37 raw pointers per node - the natural shape once the tree no longer
//! needs to be built with `malloc`.

const ALPHABET_SIZE: usize = 37;

#[derive(Default)]
struct Node {
    terminal: bool,
    children: [Option<u32>; ALPHABET_SIZE],
    boundary: Option<u32>,
}

/// A set of domains supporting exact-match and subdomain ("suffix") lookup.
pub struct DomainTrie {
    nodes: Vec<Node>,
}

impl Default for DomainTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainTrie {
    pub fn new() -> Self {
        DomainTrie {
            nodes: vec![Node::default()],
        }
    }

    fn char_index(c: char) -> Option<usize> {
        match c {
            'a'..='z' => Some(c as usize - 'a' as usize),
            'A'..='Z' => Some(c as usize - 'A' as usize),
            '0'..='9' => Some(26 + (c as usize - '0' as usize)),
            '-' => Some(36),
            _ => None,
        }
    }

    fn child_or_insert(&mut self, node: usize, idx: usize) -> usize {
        if let Some(next) = self.nodes[node].children[idx] {
            return next as usize;
        }
        let new_idx = self.nodes.len() as u32;
        self.nodes.push(Node::default());
        self.nodes[node].children[idx] = Some(new_idx);
        new_idx as usize
    }

    fn boundary_or_insert(&mut self, node: usize) -> usize {
        if let Some(next) = self.nodes[node].boundary {
            return next as usize;
        }
        let new_idx = self.nodes.len() as u32;
        self.nodes.push(Node::default());
        self.nodes[node].boundary = Some(new_idx);
        new_idx as usize
    }

    /// Inserts `domain` as an exact entry, or - when `domain` starts with a
    /// leading dot - as a suffix entry matching only strict subdomains.
    /// Labels containing a character outside `A-Z a-z 0-9 -` are silently
    /// skipped, matching the original trie builder's refusal to represent
    /// them rather than erroring.
    ///
    /// The leading-dot case needs no special branch: splitting `.example.com`
    /// on `.` yields a leading empty label. Walking labels right-to-left,
    /// that empty label is the *last* one processed, and contributes an
    /// extra "next label boundary" step with zero characters consumed - so
    /// the membership flag lands one boundary node past the exact-match
    /// node for `example.com`, not on it. [`DomainTrie::contains_suffix`]'s
    /// walk checks exactly that boundary node before consuming each further
    /// label, which is what lets a strict subdomain match while the bare
    /// domain itself does not. This mirrors `walk_domain_set`'s recursive
    /// `dot = strrchr(domain, '.')` descent in the reference implementation,
    /// which marks the child-of-the-last-matched-node's `.s` pointer rather
    /// than the node itself whenever a dot remains unconsumed.
    pub fn insert(&mut self, domain: &str) {
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return;
        }
        let labels: Vec<&str> = domain.split('.').collect();
        let mut cur = 0usize;
        for (i, label) in labels.iter().rev().enumerate() {
            if i > 0 {
                cur = self.boundary_or_insert(cur);
            }
            for ch in label.chars().rev() {
                let Some(idx) = Self::char_index(ch) else {
                    return;
                };
                cur = self.child_or_insert(cur, idx);
            }
        }
        self.nodes[cur].terminal = true;
    }

    /// Exact membership: `domain` itself was inserted as a plain (non-dot)
    /// entry. Does not honor suffix entries - use [`contains_suffix`] for
    /// the local-domain exemption check, which is what the daemon wants.
    ///
    /// [`contains_suffix`]: DomainTrie::contains_suffix
    pub fn contains(&self, domain: &str) -> bool {
        self.walk(domain, false)
    }

    /// `domain` equals some plain inserted entry, or is a subdomain (strict
    /// or not) of some leading-dot inserted suffix entry. This is the query
    /// the daemon's local-domain membership check actually wants, since a
    /// site's domain list ordinarily mixes both kinds of entry.
    pub fn contains_suffix(&self, domain: &str) -> bool {
        self.walk(domain, true)
    }

    fn walk(&self, domain: &str, allow_parent_match: bool) -> bool {
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return false;
        }
        let labels: Vec<&str> = domain.split('.').collect();
        let mut cur = 0usize;
        for (i, label) in labels.iter().rev().enumerate() {
            if allow_parent_match && self.nodes[cur].terminal {
                return true;
            }
            if i > 0 {
                match self.nodes[cur].boundary {
                    Some(next) => cur = next as usize,
                    None => return false,
                }
            }
            for ch in label.chars().rev() {
                if allow_parent_match && self.nodes[cur].terminal {
                    return true;
                }
                let Some(idx) = Self::char_index(ch) else {
                    return false;
                };
                match self.nodes[cur].children[idx] {
                    Some(next) => cur = next as usize,
                    None => return false,
                }
            }
        }
        self.nodes[cur].terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let mut t = DomainTrie::new();
        t.insert("example.com");
        assert!(t.contains("example.com"));
        assert!(t.contains("EXAMPLE.COM"));
        assert!(!t.contains("other.com"));
        assert!(!t.contains("mail.example.com"));
    }

    #[test]
    fn suffix_match() {
        let mut t = DomainTrie::new();
        t.insert("example.com");
        assert!(t.contains_suffix("example.com"));
        assert!(t.contains_suffix("mail.example.com"));
        assert!(t.contains_suffix("a.b.example.com"));
        assert!(!t.contains_suffix("notexample.com"));
        assert!(!t.contains_suffix("com"));
    }

    #[test]
    fn disjoint_domains_share_shorter_labels() {
        let mut t = DomainTrie::new();
        t.insert("example.com");
        t.insert("other.example.com");
        assert!(t.contains_suffix("other.example.com"));
        assert!(t.contains_suffix("sub.other.example.com"));
        assert!(t.contains("other.example.com"));
    }

    #[test]
    fn leading_dot_is_a_strict_subdomain_wildcard() {
        let mut t = DomainTrie::new();
        t.insert("example.com");
        t.insert(".example.com");
        t.insert(".my-examples.com");
        assert!(t.contains_suffix("example.com"));
        assert!(t.contains_suffix("mail.example.com"));
        assert!(!t.contains_suffix("my-examples.com"));
        assert!(t.contains_suffix("a.my-examples.com"));
    }

    #[test]
    fn dot_only_suffix_entry_does_not_match_the_bare_domain() {
        let mut t = DomainTrie::new();
        t.insert(".example.net");
        assert!(!t.contains_suffix("example.net"));
        assert!(t.contains_suffix("mail.example.net"));
        assert!(t.contains_suffix("a.b.example.net"));
    }
}
