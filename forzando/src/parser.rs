//! SFZ document scanner.
//!
//! The engine consumes instrument text as a stream of header and opcode
//! events; full SFZ preprocessing (`#include`, `#define`, recursive files)
//! belongs to the external parser that normally sits in front of this
//! interface. The scanner here understands headers, `key=value` opcodes
//! with spaces in values, and both comment styles, which is the shape the
//! engine needs for loading and for tests.

use tracing::warn;

/// Header kinds the engine reacts to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Header {
    Global,
    Master,
    Group,
    Region,
    Control,
    Curve,
    Effect,
}

impl Header {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "global" => Header::Global,
            "master" => Header::Master,
            "group" => Header::Group,
            "region" => Header::Region,
            "control" => Header::Control,
            "curve" => Header::Curve,
            "effect" => Header::Effect,
            _ => return None,
        })
    }
}

/// Receiver of scan events, in document order.
pub trait ParserListener {
    fn on_header(&mut self, header: Header);
    /// Raw opcode name and value; name splitting happens downstream.
    fn on_opcode(&mut self, name: &str, value: &str);
}

/// Scan a document, emitting events to `listener`.
///
/// Returns the number of headers seen. Unknown headers are skipped with a
/// warning; their opcodes are suppressed until the next known header.
pub fn parse_document(text: &str, listener: &mut impl ParserListener) -> usize {
    let text = strip_block_comments(text);
    let mut headers = 0;
    let mut suppressing = false;

    for raw_line in text.lines() {
        let line = match raw_line.find("//") {
            Some(index) => &raw_line[..index],
            None => raw_line,
        };

        let mut rest = line.trim();
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('<') {
                let Some(close) = stripped.find('>') else {
                    warn!("unterminated header in line: {raw_line:?}");
                    break;
                };
                let name = &stripped[..close];
                match Header::from_name(name) {
                    Some(header) => {
                        listener.on_header(header);
                        headers += 1;
                        suppressing = false;
                    }
                    None => {
                        warn!("unknown header <{name}>, skipping its opcodes");
                        suppressing = true;
                    }
                }
                rest = stripped[close + 1..].trim_start();
                continue;
            }
            if rest.starts_with('#') {
                // Preprocessor directives (#include, #define) are the outer
                // parser's concern.
                warn!("preprocessor directive ignored: {rest:?}");
                break;
            }

            // An opcode runs from `name=` to the start of the next opcode
            // or header on the same line; values may contain spaces.
            let Some(equals) = rest.find('=') else {
                warn!("stray token in sfz text: {rest:?}");
                break;
            };
            let name = rest[..equals].trim();
            let after = &rest[equals + 1..];
            let value_end = find_value_end(after);
            let value = after[..value_end].trim();
            if !name.is_empty() && !suppressing {
                listener.on_opcode(name, value);
            }
            rest = after[value_end..].trim_start();
        }
    }
    headers
}

/// Find where an opcode value ends: at the next `<` header or before the
/// last space-delimited word that precedes a further `=`.
fn find_value_end(text: &str) -> usize {
    let mut end = text.len();
    if let Some(header) = text.find('<') {
        end = header;
    }
    let scan = &text[..end];
    if let Some(equals) = scan.find('=') {
        // Walk back from the '=' to the whitespace before the next opcode
        // name.
        let head = &scan[..equals];
        match head.rfind(char::is_whitespace) {
            Some(space) => end = space,
            None => end = 0,
        }
    }
    end
}

fn strip_block_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(close) => rest = &rest[start + close + 2..],
            None => {
                warn!("unterminated block comment");
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ParserListener for Recorder {
        fn on_header(&mut self, header: Header) {
            self.events.push(format!("<{header:?}>"));
        }
        fn on_opcode(&mut self, name: &str, value: &str) {
            self.events.push(format!("{name}={value}"));
        }
    }

    fn scan(text: &str) -> Vec<String> {
        let mut recorder = Recorder::default();
        parse_document(text, &mut recorder);
        recorder.events
    }

    #[test]
    fn basic_region() {
        let events = scan("<region> sample=kick.wav key=36");
        assert_eq!(events, vec!["<Region>", "sample=kick.wav", "key=36"]);
    }

    #[test]
    fn values_may_contain_spaces() {
        let events = scan("<region> sample=My Piano C4.wav lovel=10");
        assert_eq!(events, vec!["<Region>", "sample=My Piano C4.wav", "lovel=10"]);
    }

    #[test]
    fn multiple_headers_per_line() {
        let events = scan("<group> lovel=64 <region> sample=a.wav <region> sample=b.wav");
        assert_eq!(
            events,
            vec!["<Group>", "lovel=64", "<Region>", "sample=a.wav", "<Region>", "sample=b.wav"]
        );
    }

    #[test]
    fn comments_are_stripped() {
        let events = scan(
            "// full line comment\n<region> sample=a.wav // trailing\n/* block\n spanning */ key=60",
        );
        assert_eq!(events, vec!["<Region>", "sample=a.wav", "key=60"]);
    }

    #[test]
    fn unknown_headers_suppress_their_opcodes() {
        let events = scan("<sample> weird=1\n<region> key=60");
        assert_eq!(events, vec!["<Region>", "key=60"]);
    }

    #[test]
    fn curve_headers_pass_points() {
        let events = scan("<curve> curve_index=17 v000=0 v127=1");
        assert_eq!(events, vec!["<Curve>", "curve_index=17", "v000=0", "v127=1"]);
    }

    #[test]
    fn empty_input_has_no_headers() {
        let mut recorder = Recorder::default();
        assert_eq!(parse_document("", &mut recorder), 0);
        assert!(recorder.events.is_empty());
    }
}
