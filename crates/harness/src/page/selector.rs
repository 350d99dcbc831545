//! CSS selector subset used by the simulated page
//!
//! Supports type, `#id`, `.class`, `[attr]`, `[attr=value]`, the
//! descendant and `>` child combinators, and comma-separated lists.

use webprobe_common::{HarnessError, HarnessResult};

/// Read access to a document tree for selector matching
pub trait SelectorTarget {
    fn parent(&self, idx: usize) -> Option<usize>;
    fn tag(&self, idx: usize) -> &str;
    fn id(&self, idx: usize) -> Option<&str>;
    fn has_class(&self, idx: usize, class: &str) -> bool;
    fn attr(&self, idx: usize, name: &str) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrTest {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attrs.is_empty()
    }

    fn matches<T: SelectorTarget + ?Sized>(&self, doc: &T, idx: usize) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && !doc.tag(idx).eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if doc.id(idx) != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| doc.has_class(idx, c)) {
            return false;
        }
        self.attrs.iter().all(|a| match (&a.value, doc.attr(idx, &a.name)) {
            (None, found) => found.is_some(),
            (Some(want), Some(found)) => want == found,
            (Some(_), None) => false,
        })
    }
}

/// One complex selector: compounds joined by combinators, rightmost last
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    parts: Vec<(Combinator, Compound)>,
}

impl Complex {
    fn matches<T: SelectorTarget + ?Sized>(&self, doc: &T, idx: usize) -> bool {
        match self.parts.split_last() {
            Some(((_, subject), rest)) => subject.matches(doc, idx) && Self::match_ancestors(rest, doc, idx, self.parts.last().map(|p| p.0)),
            None => false,
        }
    }

    /// Match the remaining compounds (right to left) against ancestors of `idx`
    fn match_ancestors<T: SelectorTarget + ?Sized>(
        rest: &[(Combinator, Compound)],
        doc: &T,
        idx: usize,
        combinator: Option<Combinator>,
    ) -> bool {
        let Some(((next_comb, compound), remaining)) = rest.split_last() else {
            return true;
        };
        match combinator {
            Some(Combinator::Child) => match doc.parent(idx) {
                Some(p) => compound.matches(doc, p) && Self::match_ancestors(remaining, doc, p, Some(*next_comb)),
                None => false,
            },
            _ => {
                let mut cursor = doc.parent(idx);
                while let Some(p) = cursor {
                    if compound.matches(doc, p) && Self::match_ancestors(remaining, doc, p, Some(*next_comb)) {
                        return true;
                    }
                    cursor = doc.parent(p);
                }
                false
            }
        }
    }
}

/// A parsed selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(input: &str) -> HarnessResult<Self> {
        let alternatives = input
            .split(',')
            .map(|alt| parse_complex(alt.trim(), input))
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { alternatives })
    }

    pub fn matches<T: SelectorTarget + ?Sized>(&self, doc: &T, idx: usize) -> bool {
        self.alternatives.iter().any(|c| c.matches(doc, idx))
    }
}

fn invalid(selector: &str, reason: &str) -> HarnessError {
    HarnessError::InvalidInput(format!("invalid selector '{}': {}", selector, reason))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn parse_complex(input: &str, whole: &str) -> HarnessResult<Complex> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut parts = Vec::new();
    let mut pending = Combinator::Descendant;

    while pos < chars.len() {
        // Combinator between compounds
        let mut saw_space = false;
        while pos < chars.len() && chars[pos].is_whitespace() {
            saw_space = true;
            pos += 1;
        }
        if pos < chars.len() && chars[pos] == '>' {
            if parts.is_empty() {
                return Err(invalid(whole, "leading '>'"));
            }
            pending = Combinator::Child;
            pos += 1;
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
        } else if saw_space && !parts.is_empty() {
            pending = Combinator::Descendant;
        }
        if pos >= chars.len() {
            break;
        }

        let compound = parse_compound(&chars, &mut pos, whole)?;
        if compound.is_empty() {
            return Err(invalid(whole, &format!("unexpected '{}'", chars[pos])));
        }
        parts.push((pending, compound));
        pending = Combinator::Descendant;
    }

    if parts.is_empty() {
        return Err(invalid(whole, "empty selector"));
    }
    Ok(Complex { parts })
}

fn read_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn parse_compound(chars: &[char], pos: &mut usize, whole: &str) -> HarnessResult<Compound> {
    let mut compound = Compound::default();

    if chars[*pos] == '*' {
        compound.tag = Some("*".into());
        *pos += 1;
    } else if is_ident_char(chars[*pos]) {
        compound.tag = Some(read_ident(chars, pos));
    }

    while *pos < chars.len() {
        match chars[*pos] {
            '#' => {
                *pos += 1;
                let id = read_ident(chars, pos);
                if id.is_empty() {
                    return Err(invalid(whole, "empty id"));
                }
                compound.id = Some(id);
            }
            '.' => {
                *pos += 1;
                let class = read_ident(chars, pos);
                if class.is_empty() {
                    return Err(invalid(whole, "empty class"));
                }
                compound.classes.push(class);
            }
            '[' => {
                *pos += 1;
                compound.attrs.push(parse_attr(chars, pos, whole)?);
            }
            _ => break,
        }
    }
    Ok(compound)
}

fn parse_attr(chars: &[char], pos: &mut usize, whole: &str) -> HarnessResult<AttrTest> {
    let name = read_ident(chars, pos);
    if name.is_empty() {
        return Err(invalid(whole, "empty attribute name"));
    }
    match chars.get(*pos) {
        Some(']') => {
            *pos += 1;
            Ok(AttrTest { name, value: None })
        }
        Some('=') => {
            *pos += 1;
            let value = match chars.get(*pos) {
                Some(&q) if q == '"' || q == '\'' => {
                    *pos += 1;
                    let start = *pos;
                    while *pos < chars.len() && chars[*pos] != q {
                        *pos += 1;
                    }
                    if *pos >= chars.len() {
                        return Err(invalid(whole, "unterminated attribute value"));
                    }
                    let v: String = chars[start..*pos].iter().collect();
                    *pos += 1;
                    v
                }
                _ => read_ident(chars, pos),
            };
            if chars.get(*pos) != Some(&']') {
                return Err(invalid(whole, "expected ']'"));
            }
            *pos += 1;
            Ok(AttrTest { name, value: Some(value) })
        }
        _ => Err(invalid(whole, "expected ']' or '='")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        parent: Option<usize>,
        tag: &'static str,
        id: Option<&'static str>,
        classes: Vec<&'static str>,
        attrs: Vec<(&'static str, &'static str)>,
    }

    struct Tree(Vec<Node>);

    impl SelectorTarget for Tree {
        fn parent(&self, idx: usize) -> Option<usize> {
            self.0[idx].parent
        }
        fn tag(&self, idx: usize) -> &str {
            self.0[idx].tag
        }
        fn id(&self, idx: usize) -> Option<&str> {
            self.0[idx].id
        }
        fn has_class(&self, idx: usize, class: &str) -> bool {
            self.0[idx].classes.contains(&class)
        }
        fn attr(&self, idx: usize, name: &str) -> Option<&str> {
            self.0[idx].attrs.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        }
    }

    fn tree() -> Tree {
        Tree(vec![
            Node { parent: None, tag: "div", id: None, classes: vec!["new-game-primary"], attrs: vec![] },
            Node { parent: Some(0), tag: "button", id: Some("guest-button"), classes: vec![], attrs: vec![] },
            Node { parent: Some(0), tag: "span", id: None, classes: vec!["wrap"], attrs: vec![] },
            Node { parent: Some(2), tag: "button", id: None, classes: vec![], attrs: vec![("data-note", "3c")] },
        ])
    }

    #[test]
    fn test_child_and_descendant_combinators() {
        let doc = tree();
        let child = Selector::parse(".new-game-primary > button").unwrap();
        assert!(child.matches(&doc, 1));
        assert!(!child.matches(&doc, 3));

        let descendant = Selector::parse(".new-game-primary button").unwrap();
        assert!(descendant.matches(&doc, 1));
        assert!(descendant.matches(&doc, 3));
    }

    #[test]
    fn test_attribute_selectors() {
        let doc = tree();
        assert!(Selector::parse("[data-note=\"3c\"]").unwrap().matches(&doc, 3));
        assert!(Selector::parse("[data-note]").unwrap().matches(&doc, 3));
        assert!(!Selector::parse("[data-note='3e']").unwrap().matches(&doc, 3));
    }

    #[test]
    fn test_id_and_list() {
        let doc = tree();
        let sel = Selector::parse("#missing, button#guest-button").unwrap();
        assert!(sel.matches(&doc, 1));
        assert!(!sel.matches(&doc, 0));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("> a").is_err());
        assert!(Selector::parse("[x=").is_err());
        assert!(Selector::parse("div ~ p").is_err());
    }
}
