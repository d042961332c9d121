//! Comment masking for PowerShell source.
//!
//! Comment text is replaced with spaces so that byte offsets, and therefore
//! line and column numbers, stay identical to the input. Line breaks inside
//! block comments are kept.
//!
//! The scanner only masks text it is sure is a comment. Quoted strings and
//! here-strings are left untouched, and a `#` glued to a preceding word is not
//! a comment (`a#b` is a single bareword).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    Single,
    Double,
    HereSingle,
    HereDouble,
    Block,
    Line,
}

fn is_single_quote(c: char) -> bool {
    matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}')
}

fn is_double_quote(c: char) -> bool {
    matches!(c, '"' | '\u{201C}' | '\u{201D}' | '\u{201E}')
}

/// `#` only opens a line comment at the start of a token.
fn opens_line_comment(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(p) => p.is_whitespace() || matches!(p, ';' | '|' | '(' | '{' | '}'),
    }
}

/// Rest of the line after `from` holds only whitespace.
fn rest_of_line_blank(content: &str, from: usize) -> bool {
    content[from..]
        .split('\n')
        .next()
        .is_none_or(|rest| rest.trim().is_empty())
}

/// Replace every comment in `content` with spaces.
pub(crate) fn mask_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut state = State::Code;
    let mut prev: Option<char> = None;
    let mut line_start = true;
    let mut chars = content.char_indices().peekable();

    let blank = |out: &mut String, c: char| {
        if c == '\n' || c == '\r' {
            out.push(c);
        } else {
            out.extend(std::iter::repeat_n(' ', c.len_utf8()));
        }
    };

    while let Some((_, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        let at_line_start = line_start;
        line_start = c == '\n';

        match state {
            State::Block => {
                blank(&mut out, c);
                if c == '#' && next == Some('>') {
                    chars.next();
                    out.push(' ');
                    state = State::Code;
                }
            }
            State::Line => {
                blank(&mut out, c);
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::HereSingle | State::HereDouble => {
                out.push(c);
                let closes = if state == State::HereSingle {
                    is_single_quote(c)
                } else {
                    is_double_quote(c)
                };
                if at_line_start && closes && next == Some('@') {
                    if let Some((_, at)) = chars.next() {
                        out.push(at);
                    }
                    state = State::Code;
                }
            }
            State::Single => {
                out.push(c);
                if is_single_quote(c) {
                    if next.is_some_and(is_single_quote) {
                        if let Some((_, q)) = chars.next() {
                            out.push(q);
                        }
                    } else {
                        state = State::Code;
                    }
                }
            }
            State::Double => {
                out.push(c);
                if c == '`' {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                        line_start = escaped == '\n';
                    }
                } else if is_double_quote(c) {
                    if next.is_some_and(is_double_quote) {
                        if let Some((_, q)) = chars.next() {
                            out.push(q);
                        }
                    } else {
                        state = State::Code;
                    }
                }
            }
            State::Code => {
                if c == '`' {
                    out.push(c);
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                        line_start = escaped == '\n';
                    }
                } else if c == '@'
                    && next.is_some_and(|n| is_single_quote(n) || is_double_quote(n))
                {
                    out.push(c);
                    if let Some((quote_pos, quote)) = chars.next() {
                        out.push(quote);
                        let here = rest_of_line_blank(content, quote_pos + quote.len_utf8());
                        state = match (here, is_single_quote(quote)) {
                            (true, true) => State::HereSingle,
                            (true, false) => State::HereDouble,
                            (false, true) => State::Single,
                            (false, false) => State::Double,
                        };
                    }
                } else if is_single_quote(c) {
                    out.push(c);
                    state = State::Single;
                } else if is_double_quote(c) {
                    out.push(c);
                    state = State::Double;
                } else if c == '<' && next == Some('#') {
                    chars.next();
                    out.push_str("  ");
                    state = State::Block;
                } else if c == '#' && opens_line_comment(prev) {
                    out.push(' ');
                    state = State::Line;
                } else {
                    out.push(c);
                }
            }
        }
        prev = Some(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_preserved() {
        let src = "Write-Output 'é' <# x\n y #> done # tail\nnext";
        let masked = mask_comments(src);
        assert_eq!(masked.len(), src.len());
        assert_eq!(masked.find("done"), src.find("done"));
        assert_eq!(masked.find("next"), src.find("next"));
        assert_eq!(
            masked.split_whitespace().collect::<Vec<_>>(),
            ["Write-Output", "'é'", "done", "next"]
        );
    }

    #[test]
    fn comment_markers_inside_strings_are_text() {
        assert_eq!(mask_comments("echo '<#' x"), "echo '<#' x");
        assert_eq!(mask_comments("echo \"<#\" x"), "echo \"<#\" x");
        assert_eq!(mask_comments("echo '#' x"), "echo '#' x");
        assert_eq!(mask_comments("echo 'it''s # here'"), "echo 'it''s # here'");
        assert_eq!(mask_comments("echo \"a`\" # b\" x"), "echo \"a`\" # b\" x");
        assert_eq!(mask_comments("echo \u{2018}<#\u{2019} x"), "echo \u{2018}<#\u{2019} x");
    }

    #[test]
    fn hash_inside_a_word_is_not_a_comment() {
        assert_eq!(mask_comments("echo a#b; iex x"), "echo a#b; iex x");
        assert_eq!(mask_comments("echo `# iex"), "echo `# iex");
        assert_eq!(mask_comments("echo ok;# iex"), format!("echo ok;{}", " ".repeat(5)));
    }

    #[test]
    fn here_strings_hide_nothing() {
        let src = "$s = @'\nit's <#\n'@\nFormat-Volume\n#>";
        let masked = mask_comments(src);
        assert!(masked.contains("Format-Volume"));
        assert!(masked.contains("it's <#"));

        let src = "$s = @\"\nsay \"hi\" # x\n\"@\niex $s # run";
        assert_eq!(
            mask_comments(src),
            format!("$s = @\"\nsay \"hi\" # x\n\"@\niex $s {}", " ".repeat(5))
        );
    }

    #[test]
    fn unterminated_block_masks_to_end() {
        assert_eq!(mask_comments("a <# b\nc"), format!("a{}\n ", " ".repeat(5)));
    }
}
