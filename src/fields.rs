//! Line classification for the catalog dump.
//!
//! Recognition is keyword-prefix based and case-insensitive. Numeric payloads
//! that fail to convert become `None` instead of failing the line.

use crate::config::TITLE_MAX_CHARS;
use memchr::memchr_iter;
use once_cell::sync::Lazy;
use regex::Regex;

static REVIEWS_HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^reviews:\s*total:\s*(\S+)\s+downloaded:\s*(\S+)(?:\s+avg\s+rating:\s*(\S+))?",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Id(Option<i64>),
    Asin(String),
    Title(String),
    Group(String),
    SalesRank(Option<i64>),
    Similar(Vec<String>),
    CategoriesDeclared(usize),
    ReviewsDeclared {
        total: Option<u64>,
        downloaded: usize,
        avg_rating: Option<f64>,
    },
    ReviewEntry(ReviewEntry),
    Discontinued,
    Blank,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewEntry {
    pub date: String,
    pub customer_id: String,
    pub rating: i64,
    pub votes: i64,
    pub helpful: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReview {
    FieldCount(usize),
    Keyword(&'static str),
    Number(&'static str),
    RatingOutOfRange(i64),
}

/// Strips `prefix` when `line` starts with it, ignoring ASCII case.
fn strip_keyword<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

fn first_token(rest: &str) -> Option<&str> {
    rest.split_whitespace().next()
}

fn parse_int(token: Option<&str>) -> Option<i64> {
    token?.parse().ok()
}

fn cap_title(title: &str) -> String {
    match title.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => title[..cut].to_string(),
        None => title.to_string(),
    }
}

pub fn recognize(line: &str) -> Field {
    let line = line.trim();
    if line.is_empty() {
        return Field::Blank;
    }

    if let Some(rest) = strip_keyword(line, "id:") {
        return Field::Id(parse_int(first_token(rest)));
    }
    if let Some(rest) = strip_keyword(line, "asin:") {
        return match first_token(rest) {
            Some(asin) => Field::Asin(asin.to_string()),
            None => Field::Unrecognized,
        };
    }
    if let Some(rest) = strip_keyword(line, "title:") {
        return Field::Title(cap_title(rest.trim()));
    }
    if let Some(rest) = strip_keyword(line, "group:") {
        return Field::Group(rest.trim().to_string());
    }
    if let Some(rest) = strip_keyword(line, "salesrank:") {
        return Field::SalesRank(parse_int(first_token(rest)));
    }
    if let Some(rest) = strip_keyword(line, "similar:") {
        return Field::Similar(parse_similar(rest));
    }
    if let Some(rest) = strip_keyword(line, "categories:") {
        let count = first_token(rest)
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);
        return Field::CategoriesDeclared(count);
    }
    if strip_keyword(line, "reviews:").is_some() {
        return parse_reviews_header(line);
    }
    if line.eq_ignore_ascii_case("discontinued product") {
        return Field::Discontinued;
    }

    match parse_review_entry(line) {
        Ok(entry) => Field::ReviewEntry(entry),
        Err(_) => Field::Unrecognized,
    }
}

/// `<count> <asin>...`; a malformed count keeps every listed token.
fn parse_similar(rest: &str) -> Vec<String> {
    let mut tokens = rest.split_whitespace();
    let declared = tokens.next().and_then(|t| t.parse::<usize>().ok());
    let listed = tokens.map(str::to_string);
    match declared {
        Some(n) => listed.take(n).collect(),
        None => listed.collect(),
    }
}

fn parse_reviews_header(line: &str) -> Field {
    let Some(caps) = REVIEWS_HEADER_REGEX.captures(line) else {
        return Field::ReviewsDeclared {
            total: None,
            downloaded: 0,
            avg_rating: None,
        };
    };
    Field::ReviewsDeclared {
        total: caps[1].parse().ok(),
        downloaded: caps[2].parse().unwrap_or(0),
        avg_rating: caps.get(3).and_then(|m| m.as_str().parse().ok()),
    }
}

/// `<date> customer: <id> rating: <r> votes: <v> helpful: <h>`.
///
/// The public dumps spell the keyword `cutomer:`; both spellings are accepted.
pub fn parse_review_entry(line: &str) -> Result<ReviewEntry, MalformedReview> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 9 {
        return Err(MalformedReview::FieldCount(tokens.len()));
    }

    let keyword = |idx: usize, expected: &[&str], name: &'static str| {
        if expected.iter().any(|k| tokens[idx].eq_ignore_ascii_case(k)) {
            Ok(())
        } else {
            Err(MalformedReview::Keyword(name))
        }
    };
    keyword(1, &["customer:", "cutomer:"], "customer")?;
    keyword(3, &["rating:"], "rating")?;
    keyword(5, &["votes:"], "votes")?;
    keyword(7, &["helpful:"], "helpful")?;

    let number = |idx: usize, name: &'static str| {
        tokens[idx]
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or(MalformedReview::Number(name))
    };
    let rating = number(4, "rating")?;
    if rating > 5 {
        return Err(MalformedReview::RatingOutOfRange(rating));
    }

    Ok(ReviewEntry {
        date: tokens[0].to_string(),
        customer_id: tokens[2].to_string(),
        rating,
        votes: number(6, "votes")?,
        helpful: number(8, "helpful")?,
    })
}

/// One `name[id]` segment of a taxonomy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment<'a> {
    pub name: &'a str,
    pub id: &'a str,
}

/// Splits `|name[id]|name[id]...` into segments, root first.
///
/// Names may themselves contain brackets, so the id is taken from the last
/// `[`. Segments without a trailing `[id]` are skipped.
pub fn parse_category_path(line: &str) -> Vec<PathSegment<'_>> {
    let line = line.trim();
    let bytes = line.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;

    for end in memchr_iter(b'|', bytes).chain(std::iter::once(bytes.len())) {
        let raw = line[start..end].trim();
        start = end + 1;
        if raw.is_empty() {
            continue;
        }
        let Some(body) = raw.strip_suffix(']') else {
            continue;
        };
        let Some(open) = body.rfind('[') else {
            continue;
        };
        let id = body[open + 1..].trim();
        if id.is_empty() {
            continue;
        }
        segments.push(PathSegment {
            name: body[..open].trim(),
            id,
        });
    }
    segments
}

/// Lines inside a declared category sub-block start with `|`.
pub fn is_category_path_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}
