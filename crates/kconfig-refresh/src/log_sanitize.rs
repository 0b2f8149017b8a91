use std::iter::Peekable;
use std::str::Chars;

const MAX_LOG_CHARS: usize = 4096;

/// Make a subprocess output line safe to echo: terminal escape sequences,
/// control characters and bidi overrides are dropped, tabs become spaces,
/// and the result is capped at `MAX_LOG_CHARS`.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut kept = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => skip_escape(&mut chars),
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() || is_format_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }
        if kept >= MAX_LOG_CHARS {
            if chars.peek().is_some() {
                out.push_str(" ...[truncated]");
            }
            break;
        }
    }
    out
}

fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        // CSI: parameters until a final byte in '@'..='~'.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    return;
                }
            }
        }
        // OSC: terminated by BEL or ST.
        Some(']') => skip_until_st(chars, true),
        // DCS, SOS, PM, APC: terminated by ST.
        Some('P' | 'X' | '^' | '_') => skip_until_st(chars, false),
        _ => {}
    }
}

fn skip_until_st(chars: &mut Peekable<Chars<'_>>, bel_ends: bool) {
    while let Some(c) = chars.next() {
        if bel_ends && c == '\x07' {
            return;
        }
        if c == '\x1b' && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}

fn is_format_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
