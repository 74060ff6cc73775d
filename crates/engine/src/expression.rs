//! Expression protocol: flat `Function("arg1","arg2")` strings.
//!
//! Every argument is quoted and the expression delimiter (`;`) is written as
//! `\;`. Embedded double quotes are backslash-escaped, and a backslash run
//! that would otherwise escape a quote (embedded or closing) is doubled.
//! Text received back from the engine is decoded with [`decode_text`].

/// Engine function that evaluates a calc item.
pub const EVAL_ITEM: &str = "EvalItem";
/// Engine function returning the document text of a calc item.
pub const GET_ITEM_TEXT: &str = "GetCalcItemText";
/// Engine option controlling calculation UI visibility (`1` shown, `0` hidden).
pub const UI_OPTION: &str = "_CalcUI";

pub const DELIMITER: char = ';';

/// Escape every delimiter. Idempotent: a delimiter already preceded by
/// backslashes is normalised to a single `\;` rather than escaped twice.
pub fn escape_delimiters(text: &str) -> String {
    unescape_delimiters(text).replace(DELIMITER, "\\;")
}

/// Strip the backslash run in front of each delimiter.
pub fn unescape_delimiters(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut backslashes = 0usize;
    for c in text.chars() {
        match c {
            '\\' => backslashes += 1,
            DELIMITER => {
                backslashes = 0;
                out.push(DELIMITER);
            }
            other => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
                out.push(other);
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes));
    out
}

/// Escape one argument for embedding between double quotes.
pub fn quote_arg(arg: &str) -> String {
    let escaped = escape_delimiters(arg);
    let mut out = String::with_capacity(escaped.len() + 2);
    let mut backslashes = 0usize;
    for c in escaped.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
                out.push('"');
            }
            other => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
                out.push(other);
            }
        }
    }
    // The closing quote follows.
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out
}

/// Build `name("a","b",...)`.
pub fn call(name: &str, args: &[&str]) -> String {
    let quoted: Vec<String> = args
        .iter()
        .map(|a| format!("\"{}\"", quote_arg(a)))
        .collect();
    format!("{}({})", name, quoted.join(","))
}

pub fn eval_item(library_ref: &str, item_ref: &str) -> String {
    call(EVAL_ITEM, &[library_ref, item_ref])
}

pub fn get_item_text(library_ref: &str, item_ref: &str) -> String {
    call(GET_ITEM_TEXT, &[library_ref, item_ref])
}

/// Decode engine string text back into plain text. In front of a quote,
/// `2n + 1` backslashes stand for `n` backslashes and the quote; in front of
/// a delimiter one backslash is dropped.
pub fn decode_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut backslashes = 0usize;
    for c in text.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes / 2));
                backslashes = 0;
                out.push('"');
            }
            DELIMITER => {
                out.extend(std::iter::repeat('\\').take(backslashes.saturating_sub(1)));
                backslashes = 0;
                out.push(DELIMITER);
            }
            other => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
                out.push(other);
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes));
    out
}

pub fn ui_option_value(show: bool) -> &'static str {
    if show {
        "1"
    } else {
        "0"
    }
}
