//! Placeholder substitution for per-service files.
//!
//! Placeholders are written as `$identifier` or `${dotted.key}`, and `$$` produces a literal `$`. Identifiers start
//! with a letter or underscore and continue with letters, digits, and underscores. Braced keys may additionally
//! contain `.` and `-`.

use snafu::Snafu;

use crate::Substitutions;

/// A template error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TemplateError {
    /// A `$` was not followed by a valid placeholder.
    #[snafu(display("Invalid placeholder at line {}, column {}.", line, column))]
    InvalidPlaceholder {
        /// One-based line number.
        line: usize,

        /// One-based column number.
        column: usize,
    },

    /// A placeholder named a key absent from the substitution context.
    #[snafu(display("No value for placeholder '{}'.", key))]
    MissingKey {
        /// Placeholder key.
        key: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_braced_key(c: char) -> bool {
    is_ident_continue(c) || c == '.' || c == '-'
}

fn position_of(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

impl Template {
    /// Parses template source.
    ///
    /// # Errors
    ///
    /// If a `$` is not followed by `$`, an identifier, or a non-empty braced key, an error will be returned.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }

            let invalid = || {
                let (line, column) = position_of(source, offset);
                TemplateError::InvalidPlaceholder { line, column }
            };

            match chars.peek().map(|(_, next)| *next) {
                Some('$') => {
                    chars.next();
                    literal.push('$');
                }
                Some('{') => {
                    chars.next();
                    let mut key = String::new();
                    let mut closed = false;
                    for (_, k) in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        if !is_braced_key(k) {
                            return Err(invalid());
                        }
                        key.push(k);
                    }
                    if !closed || key.is_empty() {
                        return Err(invalid());
                    }
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    segments.push(Segment::Placeholder(key));
                }
                Some(next) if is_ident_start(next) => {
                    let mut key = String::new();
                    while let Some((_, k)) = chars.peek() {
                        if !is_ident_continue(*k) {
                            break;
                        }
                        key.push(*k);
                        chars.next();
                    }
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    segments.push(Segment::Placeholder(key));
                }
                _ => return Err(invalid()),
            }
        }

        segments.push(Segment::Literal(literal));
        segments.retain(|s| !matches!(s, Segment::Literal(l) if l.is_empty()));

        Ok(Self { segments })
    }

    /// Keys referenced by the template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(key) => Some(key.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Renders the template.
    ///
    /// # Errors
    ///
    /// If a placeholder has no value in `subst`, an error will be returned.
    pub fn render(&self, subst: &Substitutions) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = subst
                        .rendered(key)
                        .ok_or_else(|| TemplateError::MissingKey { key: key.clone() })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}
