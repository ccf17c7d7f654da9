//! Word-level diff of an edited message against its prior text, used to
//! render a concise correction line on IRC.

/// The shortest contiguous run of words that changed between two texts,
/// plus one word of unchanged context on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditWindow {
    pub context_before: Option<String>,
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub context_after: Option<String>,
}

impl EditWindow {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(ctx) = &self.context_before {
            out.push_str(ctx);
            out.push(' ');
        }
        out.push_str("**");
        out.push_str(&self.removed.join(" "));
        out.push_str(" → ");
        out.push_str(&self.added.join(" "));
        out.push_str("**");
        if let Some(ctx) = &self.context_after {
            out.push(' ');
            out.push_str(ctx);
        }
        out
    }
}

/// Align `a` and `b` on word boundaries and return the change window,
/// or `None` when the texts are equal.
pub fn word_diff(a: &str, b: &str) -> Option<EditWindow> {
    if a == b {
        return None;
    }

    let aw: Vec<&str> = a.split_whitespace().collect();
    let bw: Vec<&str> = b.split_whitespace().collect();

    let mut prefix = 0;
    while prefix < aw.len() && prefix < bw.len() && aw[prefix] == bw[prefix] {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < aw.len() - prefix
        && suffix < bw.len() - prefix
        && aw[aw.len() - 1 - suffix] == bw[bw.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed: Vec<String> = aw[prefix..aw.len() - suffix]
        .iter()
        .map(|w| w.to_string())
        .collect();
    let added: Vec<String> = bw[prefix..bw.len() - suffix]
        .iter()
        .map(|w| w.to_string())
        .collect();

    if removed.is_empty() && added.is_empty() {
        // Only whitespace moved around.
        return None;
    }

    Some(EditWindow {
        context_before: prefix.checked_sub(1).map(|i| aw[i].to_string()),
        removed,
        added,
        context_after: if suffix > 0 {
            Some(aw[aw.len() - suffix].to_string())
        } else {
            None
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_texts_yield_no_window() {
        assert_eq!(word_diff("the quick brown fox", "the quick brown fox"), None);
    }

    #[test]
    fn single_word_change_keeps_one_word_of_context() {
        let w = word_diff("the quick brown fox", "the quick red fox").unwrap();
        assert_eq!(w.render(), "quick **brown → red** fox");
    }

    #[test]
    fn change_at_start_has_no_leading_context() {
        let w = word_diff("cat sat down", "dog sat down").unwrap();
        assert_eq!(w.context_before, None);
        assert_eq!(w.render(), "**cat → dog** sat");
    }

    #[test]
    fn change_at_end_has_no_trailing_context() {
        let w = word_diff("we ship friday", "we ship monday").unwrap();
        assert_eq!(w.context_after, None);
        assert_eq!(w.render(), "ship **friday → monday**");
    }

    #[test]
    fn insertion_yields_empty_removed_side() {
        let w = word_diff("a c", "a b c").unwrap();
        assert!(w.removed.is_empty());
        assert_eq!(w.added, vec!["b"]);
    }

    #[test]
    fn deletion_yields_empty_added_side() {
        let w = word_diff("a b c", "a c").unwrap();
        assert_eq!(w.removed, vec!["b"]);
        assert!(w.added.is_empty());
    }

    #[test]
    fn multi_word_window_is_contiguous() {
        let w = word_diff("one two three four five", "one deux trois four five").unwrap();
        assert_eq!(w.removed, vec!["two", "three"]);
        assert_eq!(w.added, vec!["deux", "trois"]);
        assert_eq!(w.context_before.as_deref(), Some("one"));
        assert_eq!(w.context_after.as_deref(), Some("four"));
    }

    #[test]
    fn applying_the_window_reconstructs_the_edit() {
        let a = "alpha beta gamma delta";
        let b = "alpha BETA GAMMA delta";
        let w = word_diff(a, b).unwrap();
        let aw: Vec<&str> = a.split_whitespace().collect();
        let prefix = w.context_before.as_ref().map_or(0, |c| {
            aw.iter().position(|x| x == c).unwrap() + 1
        });
        let mut rebuilt: Vec<String> = aw[..prefix].iter().map(|s| s.to_string()).collect();
        rebuilt.extend(w.added.clone());
        rebuilt.extend(aw[prefix + w.removed.len()..].iter().map(|s| s.to_string()));
        assert_eq!(rebuilt.join(" "), b);
    }
}
