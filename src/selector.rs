//! CSS selector parsing and matching over [`Dom`].
//!
//! Covers what anchor selectors and widget markup need: type, id, class and
//! attribute selectors, the four combinators, structural pseudo-classes and
//! `:not`/`:is`/`:where`/`:has`. Identifiers accept CSS backslash escapes so
//! selectors produced by [`css_escape`] resolve back to their element.

use std::collections::HashSet;

use crate::dom::{Dom, NodeId, NodeType};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorAttrCondition {
    Exists { key: String },
    Eq { key: String, value: String, fold: bool },
    StartsWith { key: String, value: String, fold: bool },
    EndsWith { key: String, value: String, fold: bool },
    Contains { key: String, value: String, fold: bool },
    Includes { key: String, value: String, fold: bool },
    DashMatch { key: String, value: String, fold: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorPseudoClass {
    Root,
    FirstChild,
    LastChild,
    OnlyChild,
    FirstOfType,
    LastOfType,
    OnlyOfType,
    Empty,
    NthChild(NthChildSelector),
    NthLastChild(NthChildSelector),
    NthOfType(NthChildSelector),
    NthLastOfType(NthChildSelector),
    Not(Vec<Vec<SelectorPart>>),
    Is(Vec<Vec<SelectorPart>>),
    Has(Vec<Vec<SelectorPart>>),
}

const SIMPLE_PSEUDO_CLASSES: &[(&str, SelectorPseudoClass)] = &[
    ("root", SelectorPseudoClass::Root),
    ("first-child", SelectorPseudoClass::FirstChild),
    ("last-child", SelectorPseudoClass::LastChild),
    ("only-child", SelectorPseudoClass::OnlyChild),
    ("first-of-type", SelectorPseudoClass::FirstOfType),
    ("last-of-type", SelectorPseudoClass::LastOfType),
    ("only-of-type", SelectorPseudoClass::OnlyOfType),
    ("empty", SelectorPseudoClass::Empty),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NthChildSelector {
    Exact(usize),
    Odd,
    Even,
    AnPlusB(i64, i64),
}

impl NthChildSelector {
    fn matches(self, position: usize) -> bool {
        let position = position as i64;
        match self {
            Self::Exact(n) => position == n as i64,
            Self::Odd => position % 2 == 1,
            Self::Even => position % 2 == 0,
            Self::AnPlusB(a, b) => {
                if a == 0 {
                    position == b
                } else {
                    let diff = position - b;
                    diff % a == 0 && diff / a >= 0
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SelectorStep {
    pub(crate) tag: Option<String>,
    pub(crate) universal: bool,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<SelectorAttrCondition>,
    pub(crate) pseudo_classes: Vec<SelectorPseudoClass>,
}

impl SelectorStep {
    fn id_only(&self) -> Option<&str> {
        if !self.universal
            && self.tag.is_none()
            && self.classes.is_empty()
            && self.attrs.is_empty()
            && self.pseudo_classes.is_empty()
        {
            self.id.as_deref()
        } else {
            None
        }
    }

    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.id.is_none()
            && self.classes.is_empty()
            && self.attrs.is_empty()
            && !self.universal
            && self.pseudo_classes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorCombinator {
    Descendant,
    Child,
    AdjacentSibling,
    GeneralSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectorPart {
    pub(crate) step: SelectorStep,
    // Relation to the previous (left) part. On the first part of a relative
    // selector (`:has(> img)`) this is the relation to the scoping element.
    pub(crate) combinator: Option<SelectorCombinator>,
}

/// Tracks nesting while scanning a selector so separators inside brackets,
/// parentheses, quoted strings or after a backslash are not treated as
/// structure.
#[derive(Default)]
struct Nesting {
    bracket: usize,
    paren: usize,
    quote: Option<char>,
    escaped: bool,
}

impl Nesting {
    /// Feeds one char; returns true when it sits at the top level and is not
    /// escaped or quoted.
    fn advance(&mut self, ch: char) -> Result<bool> {
        if self.escaped {
            self.escaped = false;
            return Ok(false);
        }
        if ch == '\\' {
            self.escaped = true;
            return Ok(false);
        }
        if let Some(quote) = self.quote {
            if ch == quote {
                self.quote = None;
            }
            return Ok(false);
        }
        match ch {
            '"' | '\'' if self.bracket > 0 || self.paren > 0 => self.quote = Some(ch),
            '[' => self.bracket += 1,
            ']' => {
                self.bracket = self
                    .bracket
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnsupportedSelector("unbalanced ]".into()))?;
            }
            '(' => self.paren += 1,
            ')' => {
                self.paren = self
                    .paren
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnsupportedSelector("unbalanced )".into()))?;
            }
            _ => return Ok(self.bracket == 0 && self.paren == 0),
        }
        Ok(false)
    }

    fn is_balanced(&self) -> bool {
        self.bracket == 0 && self.paren == 0 && self.quote.is_none() && !self.escaped
    }
}

pub(crate) fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    split_selector_groups(selector)?
        .iter()
        .map(|group| parse_selector_chain(group, false))
        .collect()
}

fn parse_relative_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    split_selector_groups(selector)?
        .iter()
        .map(|group| parse_selector_chain(group, true))
        .collect()
}

fn split_selector_groups(selector: &str) -> Result<Vec<String>> {
    let unsupported = || Error::UnsupportedSelector(selector.into());
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut nesting = Nesting::default();

    for ch in selector.chars() {
        if nesting.advance(ch)? && ch == ',' {
            let trimmed = current.trim();
            if trimmed.is_empty() {
                return Err(unsupported());
            }
            groups.push(trimmed.to_string());
            current.clear();
            continue;
        }
        current.push(ch);
    }

    if !nesting.is_balanced() {
        return Err(unsupported());
    }
    let trimmed = current.trim();
    if trimmed.is_empty() {
        return Err(unsupported());
    }
    groups.push(trimmed.to_string());
    Ok(groups)
}

fn tokenize_selector(selector: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut nesting = Nesting::default();

    for ch in selector.chars() {
        let top_level = nesting.advance(ch)?;
        if top_level && matches!(ch, '>' | '+' | '~') {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(ch.to_string());
            continue;
        }
        if top_level && ch.is_ascii_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(ch);
    }

    if !nesting.is_balanced() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_selector_chain(selector: &str, relative: bool) -> Result<Vec<SelectorPart>> {
    let unsupported = || Error::UnsupportedSelector(selector.into());
    let mut parts: Vec<SelectorPart> = Vec::new();
    let mut pending: Option<SelectorCombinator> = None;

    for token in tokenize_selector(selector.trim())? {
        let combinator = match token.as_str() {
            ">" => Some(SelectorCombinator::Child),
            "+" => Some(SelectorCombinator::AdjacentSibling),
            "~" => Some(SelectorCombinator::GeneralSibling),
            _ => None,
        };
        if let Some(combinator) = combinator {
            if pending.is_some() || (parts.is_empty() && !relative) {
                return Err(unsupported());
            }
            pending = Some(combinator);
            continue;
        }

        let step = parse_selector_step(&token)?;
        let combinator = if parts.is_empty() {
            pending.take()
        } else {
            Some(pending.take().unwrap_or(SelectorCombinator::Descendant))
        };
        parts.push(SelectorPart { step, combinator });
    }

    if parts.is_empty() || pending.is_some() {
        return Err(unsupported());
    }
    Ok(parts)
}

fn parse_selector_step(part: &str) -> Result<SelectorStep> {
    let unsupported = || Error::UnsupportedSelector(part.into());
    let mut step = SelectorStep::default();
    let mut i = 0usize;

    while let Some(ch) = part[i..].chars().next() {
        match ch {
            '*' => {
                if step.universal || step.tag.is_some() {
                    return Err(unsupported());
                }
                step.universal = true;
                i += 1;
            }
            '#' => {
                let (id, next) = parse_selector_ident(part, i + 1).ok_or_else(unsupported)?;
                if step.id.replace(id).is_some() {
                    return Err(unsupported());
                }
                i = next;
            }
            '.' => {
                let (class_name, next) =
                    parse_selector_ident(part, i + 1).ok_or_else(unsupported)?;
                step.classes.push(class_name);
                i = next;
            }
            '[' => {
                let (attr, next) = parse_selector_attr_condition(part, i)?;
                step.attrs.push(attr);
                i = next;
            }
            ':' => {
                let (pseudo, next) = parse_selector_pseudo(part, i)?;
                step.pseudo_classes.push(pseudo);
                i = next;
            }
            _ => {
                if step.tag.is_some()
                    || step.universal
                    || step.id.is_some()
                    || !step.classes.is_empty()
                    || !step.attrs.is_empty()
                    || !step.pseudo_classes.is_empty()
                {
                    return Err(unsupported());
                }
                let (tag, next) = parse_selector_ident(part, i).ok_or_else(unsupported)?;
                step.tag = Some(tag.to_ascii_lowercase());
                i = next;
            }
        }
    }

    if step.is_empty() {
        return Err(unsupported());
    }
    Ok(step)
}

/// Parses one pseudo-class at `start` (pointing at the colon). `:where`
/// folds into `:is` since specificity is irrelevant here.
fn parse_selector_pseudo(part: &str, start: usize) -> Result<(SelectorPseudoClass, usize)> {
    let unsupported = || Error::UnsupportedSelector(part.into());
    let (name, after_name) = parse_selector_ident(part, start + 1).ok_or_else(unsupported)?;
    let name = name.to_ascii_lowercase();

    if !part[after_name..].starts_with('(') {
        let pseudo = SIMPLE_PSEUDO_CLASSES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, pseudo)| pseudo.clone())
            .ok_or_else(unsupported)?;
        return Ok((pseudo, after_name));
    }

    let open = after_name;
    let close = find_matching_paren(part, open).ok_or_else(unsupported)?;
    let inner = part[open + 1..close].trim();
    let next = close + 1;
    let nth = || parse_nth_child_selector(inner).ok_or_else(unsupported);

    let pseudo = match name.as_str() {
        "nth-child" => SelectorPseudoClass::NthChild(nth()?),
        "nth-last-child" => SelectorPseudoClass::NthLastChild(nth()?),
        "nth-of-type" => SelectorPseudoClass::NthOfType(nth()?),
        "nth-last-of-type" => SelectorPseudoClass::NthLastOfType(nth()?),
        "not" => SelectorPseudoClass::Not(parse_selector_groups(inner)?),
        "is" | "where" => SelectorPseudoClass::Is(parse_selector_groups(inner)?),
        "has" => SelectorPseudoClass::Has(parse_relative_selector_groups(inner)?),
        _ => return Err(unsupported()),
    };
    Ok((pseudo, next))
}

fn find_matching_paren(src: &str, open: usize) -> Option<usize> {
    let mut nesting = Nesting::default();
    for (offset, ch) in src[open..].char_indices() {
        nesting.advance(ch).ok()?;
        if ch == ')' && nesting.paren == 0 && nesting.quote.is_none() && offset > 0 {
            return Some(open + offset);
        }
    }
    None
}

fn parse_nth_child_selector(raw: &str) -> Option<NthChildSelector> {
    let compact = raw
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    match compact.as_str() {
        "" => None,
        "odd" => Some(NthChildSelector::Odd),
        "even" => Some(NthChildSelector::Even),
        other if other.contains('n') => parse_nth_child_expression(other),
        other if other.starts_with(['+', '-']) => None,
        other => match other.parse::<usize>().ok()? {
            0 => None,
            value => Some(NthChildSelector::Exact(value)),
        },
    }
}

fn parse_nth_child_expression(expr: &str) -> Option<NthChildSelector> {
    if expr.matches('n').count() != 1 {
        return None;
    }
    let (a_part, rest) = expr.split_at(expr.find('n')?);
    let b_part = &rest[1..];

    let a = match a_part {
        "" | "+" => 1,
        "-" => -1,
        _ => a_part.parse::<i64>().ok()?,
    };
    if b_part.is_empty() {
        return Some(NthChildSelector::AnPlusB(a, 0));
    }

    let (sign, digits) = if let Some(digits) = b_part.strip_prefix('+') {
        (1, digits)
    } else if let Some(digits) = b_part.strip_prefix('-') {
        (-1, digits)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let b = digits.parse::<i64>().ok()?;
    Some(NthChildSelector::AnPlusB(a, b * sign))
}

fn is_selector_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || !ch.is_ascii()
}

/// Reads an identifier starting at byte offset `start`, resolving backslash
/// escapes. Returns the unescaped value and the offset just past it.
fn parse_selector_ident(src: &str, start: usize) -> Option<(String, usize)> {
    let mut out = String::new();
    let mut chars = src.get(start..)?.char_indices().peekable();
    let mut end = start;

    while let Some(&(offset, ch)) = chars.peek() {
        if ch == '\\' {
            chars.next();
            let (escaped, consumed) = read_escape(&src[start + offset + 1..])?;
            out.push(escaped);
            for _ in 0..consumed {
                chars.next();
            }
            end = chars.peek().map_or(src.len(), |(next, _)| start + next);
            continue;
        }
        if !is_selector_ident_char(ch) {
            break;
        }
        out.push(ch);
        chars.next();
        end = start + offset + ch.len_utf8();
    }

    if out.is_empty() {
        return None;
    }
    Some((out, end))
}

/// Decodes the escape body following a backslash. Returns the char and the
/// number of chars consumed (not counting the backslash).
fn read_escape(rest: &str) -> Option<(char, usize)> {
    let hex: String = rest
        .chars()
        .take_while(char::is_ascii_hexdigit)
        .take(6)
        .collect();
    if hex.is_empty() {
        let ch = rest.chars().next()?;
        return Some((ch, 1));
    }
    let value = u32::from_str_radix(&hex, 16).ok()?;
    let ch = char::from_u32(value)
        .filter(|ch| *ch != '\0')
        .unwrap_or('\u{FFFD}');
    let mut consumed = hex.len();
    if rest[hex.len()..].starts_with(|c: char| c.is_ascii_whitespace()) {
        consumed += 1;
    }
    Some((ch, consumed))
}

fn parse_selector_attr_condition(
    src: &str,
    open: usize,
) -> Result<(SelectorAttrCondition, usize)> {
    let unsupported = || Error::UnsupportedSelector(src.into());
    let mut i = skip_selector_ws(src, open + 1);
    let (key, next) = parse_selector_ident(src, i).ok_or_else(unsupported)?;
    let key = key.to_ascii_lowercase();
    i = skip_selector_ws(src, next);

    if src[i..].starts_with(']') {
        return Ok((SelectorAttrCondition::Exists { key }, i + 1));
    }

    let operators = ["~=", "|=", "^=", "$=", "*=", "="];
    let op = operators
        .iter()
        .find(|op| src[i..].starts_with(**op))
        .ok_or_else(unsupported)?;
    i = skip_selector_ws(src, i + op.len());

    let (value, next) = parse_selector_attr_value(src, i)?;
    i = skip_selector_ws(src, next);

    let mut fold = false;
    if let Some(flag) = src[i..].chars().next().filter(|c| matches!(c, 'i' | 'I' | 's' | 'S')) {
        fold = flag.eq_ignore_ascii_case(&'i');
        i = skip_selector_ws(src, i + 1);
    }
    if !src[i..].starts_with(']') {
        return Err(unsupported());
    }

    let condition = match *op {
        "=" => SelectorAttrCondition::Eq { key, value, fold },
        "^=" => SelectorAttrCondition::StartsWith { key, value, fold },
        "$=" => SelectorAttrCondition::EndsWith { key, value, fold },
        "*=" => SelectorAttrCondition::Contains { key, value, fold },
        "~=" => SelectorAttrCondition::Includes { key, value, fold },
        _ => SelectorAttrCondition::DashMatch { key, value, fold },
    };
    Ok((condition, i + 1))
}

fn parse_selector_attr_value(src: &str, start: usize) -> Result<(String, usize)> {
    let unsupported = || Error::UnsupportedSelector(src.into());
    let Some(quote) = src[start..].chars().next().filter(|c| matches!(c, '"' | '\'')) else {
        return parse_selector_ident(src, start).ok_or_else(unsupported);
    };

    let body_start = start + 1;
    let mut out = String::new();
    let mut chars = src[body_start..].char_indices();
    while let Some((offset, ch)) = chars.next() {
        if ch == quote {
            return Ok((out, body_start + offset + 1));
        }
        if ch == '\\' {
            let (escaped, consumed) =
                read_escape(&src[body_start + offset + 1..]).ok_or_else(unsupported)?;
            out.push(escaped);
            for _ in 0..consumed {
                chars.next();
            }
            continue;
        }
        out.push(ch);
    }
    Err(unsupported())
}

fn skip_selector_ws(src: &str, mut i: usize) -> usize {
    while src[i..].starts_with(|c: char| c.is_ascii_whitespace()) {
        i += 1;
    }
    i
}

/// Escapes CSS-significant punctuation with a backslash so an identifier can
/// be embedded in a selector.
pub fn css_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if " !\"#$%&'()*+,./:;<=>?@[\\]^`{|}~".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn attr_matches(
    actual: Option<&str>,
    expected: &str,
    fold: bool,
    test: impl Fn(&str, &str) -> bool,
) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    if fold {
        test(&actual.to_lowercase(), &expected.to_lowercase())
    } else {
        test(actual, expected)
    }
}

impl Dom {
    pub fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        Ok(self.query_selector_all(selector)?.into_iter().next())
    }

    /// Document-order matches in the light tree. Shadow roots are not entered.
    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;

        if let [group] = groups.as_slice() {
            if let [part] = group.as_slice() {
                if let Some(id) = part.step.id_only() {
                    return Ok(self.by_id_all(id));
                }
            }
        }

        let mut candidates = Vec::new();
        self.collect_elements_dfs(self.root(), &mut candidates);
        Ok(self.filter_matches(candidates, &groups))
    }

    pub fn query_selector_from(&self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        Ok(self
            .query_selector_all_from(scope, selector)?
            .into_iter()
            .next())
    }

    /// Matches among descendants of `scope`, which may be a shadow root.
    pub fn query_selector_all_from(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;
        let mut candidates = Vec::new();
        self.collect_elements_descendants_dfs(scope, &mut candidates);
        Ok(self.filter_matches(candidates, &groups))
    }

    fn filter_matches(&self, candidates: Vec<NodeId>, groups: &[Vec<SelectorPart>]) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|candidate| {
                groups
                    .iter()
                    .any(|parts| self.matches_selector_chain(*candidate, parts, None))
                    && seen.insert(*candidate)
            })
            .collect()
    }

    pub fn matches_selector(&self, node_id: NodeId, selector: &str) -> Result<bool> {
        if self.element(node_id).is_none() {
            return Ok(false);
        }
        let groups = parse_selector_groups(selector)?;
        Ok(groups
            .iter()
            .any(|parts| self.matches_selector_chain(node_id, parts, None)))
    }

    /// Nearest inclusive ancestor element matching `selector`.
    pub fn closest(&self, node_id: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let groups = parse_selector_groups(selector)?;
        let mut cursor = self.element(node_id).map(|_| node_id);
        while let Some(current) = cursor {
            if groups
                .iter()
                .any(|parts| self.matches_selector_chain(current, parts, None))
            {
                return Ok(Some(current));
            }
            cursor = self.parent_element(current);
        }
        Ok(None)
    }

    /// Matches `parts` right to left with backtracking. With a `scope`, the
    /// leftmost part must stand in its combinator relation to that element.
    pub(crate) fn matches_selector_chain(
        &self,
        node_id: NodeId,
        parts: &[SelectorPart],
        scope: Option<NodeId>,
    ) -> bool {
        let Some((last, rest)) = parts.split_last() else {
            return false;
        };
        if !self.matches_step(node_id, &last.step) {
            return false;
        }

        if rest.is_empty() {
            return match scope {
                None => true,
                Some(scope) => self.is_related(
                    scope,
                    node_id,
                    last.combinator.unwrap_or(SelectorCombinator::Descendant),
                ),
            };
        }

        match last.combinator.unwrap_or(SelectorCombinator::Descendant) {
            SelectorCombinator::Child => self
                .parent_element(node_id)
                .is_some_and(|parent| self.matches_selector_chain(parent, rest, scope)),
            SelectorCombinator::Descendant => {
                let mut cursor = self.parent_element(node_id);
                while let Some(ancestor) = cursor {
                    if self.matches_selector_chain(ancestor, rest, scope) {
                        return true;
                    }
                    cursor = self.parent_element(ancestor);
                }
                false
            }
            SelectorCombinator::AdjacentSibling => self
                .previous_element_sibling(node_id)
                .is_some_and(|sibling| self.matches_selector_chain(sibling, rest, scope)),
            SelectorCombinator::GeneralSibling => {
                let mut cursor = self.previous_element_sibling(node_id);
                while let Some(sibling) = cursor {
                    if self.matches_selector_chain(sibling, rest, scope) {
                        return true;
                    }
                    cursor = self.previous_element_sibling(sibling);
                }
                false
            }
        }
    }

    fn is_related(&self, scope: NodeId, node_id: NodeId, combinator: SelectorCombinator) -> bool {
        match combinator {
            SelectorCombinator::Descendant => {
                node_id != scope && self.is_descendant_of(node_id, scope)
            }
            SelectorCombinator::Child => self.parent(node_id) == Some(scope),
            SelectorCombinator::AdjacentSibling => {
                self.previous_element_sibling(node_id) == Some(scope)
            }
            SelectorCombinator::GeneralSibling => {
                let mut cursor = self.previous_element_sibling(node_id);
                while let Some(sibling) = cursor {
                    if sibling == scope {
                        return true;
                    }
                    cursor = self.previous_element_sibling(sibling);
                }
                false
            }
        }
    }

    pub(crate) fn matches_step(&self, node_id: NodeId, step: &SelectorStep) -> bool {
        let Some(element) = self.element(node_id) else {
            return false;
        };

        if let Some(tag) = &step.tag {
            if !element.tag_name().eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &step.id {
            if element.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !step.classes.iter().all(|class_name| element.has_class(class_name)) {
            return false;
        }

        let attrs_match = step.attrs.iter().all(|cond| match cond {
            SelectorAttrCondition::Exists { key } => element.has_attr(key),
            SelectorAttrCondition::Eq { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| a == v)
            }
            SelectorAttrCondition::StartsWith { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| {
                    !v.is_empty() && a.starts_with(v)
                })
            }
            SelectorAttrCondition::EndsWith { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| {
                    !v.is_empty() && a.ends_with(v)
                })
            }
            SelectorAttrCondition::Contains { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| {
                    !v.is_empty() && a.contains(v)
                })
            }
            SelectorAttrCondition::Includes { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| {
                    a.split_whitespace().any(|token| token == v)
                })
            }
            SelectorAttrCondition::DashMatch { key, value, fold } => {
                attr_matches(element.attr(key), value, *fold, |a, v| {
                    a == v || a.strip_prefix(v).is_some_and(|rest| rest.starts_with('-'))
                })
            }
        });
        if !attrs_match {
            return false;
        }

        step.pseudo_classes
            .iter()
            .all(|pseudo| self.matches_pseudo(node_id, pseudo))
    }

    fn matches_pseudo(&self, node_id: NodeId, pseudo: &SelectorPseudoClass) -> bool {
        match pseudo {
            SelectorPseudoClass::Root => self.document_element() == Some(node_id),
            SelectorPseudoClass::FirstChild => self.previous_element_sibling(node_id).is_none(),
            SelectorPseudoClass::LastChild => self.next_element_sibling(node_id).is_none(),
            SelectorPseudoClass::OnlyChild => {
                self.previous_element_sibling(node_id).is_none()
                    && self.next_element_sibling(node_id).is_none()
            }
            SelectorPseudoClass::FirstOfType => self.type_position(node_id, false) == Some(1),
            SelectorPseudoClass::LastOfType => self.type_position(node_id, true) == Some(1),
            SelectorPseudoClass::OnlyOfType => {
                self.type_position(node_id, false) == Some(1)
                    && self.type_position(node_id, true) == Some(1)
            }
            SelectorPseudoClass::Empty => self.children(node_id).iter().all(|child| {
                match self.node_type(*child) {
                    Some(NodeType::Comment(_)) => true,
                    Some(NodeType::Text(text)) => text.is_empty(),
                    _ => false,
                }
            }),
            SelectorPseudoClass::NthChild(nth) => self
                .sibling_position(node_id, false)
                .is_some_and(|position| nth.matches(position)),
            SelectorPseudoClass::NthLastChild(nth) => self
                .sibling_position(node_id, true)
                .is_some_and(|position| nth.matches(position)),
            SelectorPseudoClass::NthOfType(nth) => self
                .type_position(node_id, false)
                .is_some_and(|position| nth.matches(position)),
            SelectorPseudoClass::NthLastOfType(nth) => self
                .type_position(node_id, true)
                .is_some_and(|position| nth.matches(position)),
            SelectorPseudoClass::Not(groups) => !groups
                .iter()
                .any(|parts| self.matches_selector_chain(node_id, parts, None)),
            SelectorPseudoClass::Is(groups) => groups
                .iter()
                .any(|parts| self.matches_selector_chain(node_id, parts, None)),
            SelectorPseudoClass::Has(groups) => self.matches_has(node_id, groups),
        }
    }

    fn matches_has(&self, node_id: NodeId, groups: &[Vec<SelectorPart>]) -> bool {
        let looks_sideways = groups.iter().any(|parts| {
            matches!(
                parts.first().and_then(|part| part.combinator),
                Some(SelectorCombinator::AdjacentSibling | SelectorCombinator::GeneralSibling)
            )
        });
        let mut candidates = Vec::new();
        match self.parent(node_id).filter(|_| looks_sideways) {
            Some(parent) => self.collect_elements_descendants_dfs(parent, &mut candidates),
            None => self.collect_elements_descendants_dfs(node_id, &mut candidates),
        }
        candidates.into_iter().any(|candidate| {
            groups
                .iter()
                .any(|parts| self.matches_selector_chain(candidate, parts, Some(node_id)))
        })
    }

    /// 1-based position among element siblings, counted from the end when
    /// `from_end` is set.
    fn sibling_position(&self, node_id: NodeId, from_end: bool) -> Option<usize> {
        let parent = self.parent(node_id)?;
        let siblings = self.child_elements(parent);
        let index = siblings.iter().position(|sibling| *sibling == node_id)?;
        Some(if from_end {
            siblings.len() - index
        } else {
            index + 1
        })
    }

    fn type_position(&self, node_id: NodeId, from_end: bool) -> Option<usize> {
        let tag = self.tag_name(node_id)?;
        let parent = self.parent(node_id)?;
        let same_type: Vec<NodeId> = self
            .child_elements(parent)
            .into_iter()
            .filter(|sibling| self.is_tag(*sibling, tag))
            .collect();
        let index = same_type.iter().position(|sibling| *sibling == node_id)?;
        Some(if from_end {
            same_type.len() - index
        } else {
            index + 1
        })
    }
}
