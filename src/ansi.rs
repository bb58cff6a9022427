/// Remove ANSI escape sequences so echo matching sees the text a human
/// would. Handles CSI, OSC (BEL- or ST-terminated), charset designation,
/// and single-character escapes; everything else passes through.
pub fn strip_ansi(input: &str) -> String {
    #[derive(Clone, Copy)]
    enum State {
        Text,
        Escape,
        Csi,
        Osc,
        OscEscape,
        Charset,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Text;
    for ch in input.chars() {
        state = match (state, ch) {
            (State::Text, '\x1b') => State::Escape,
            (State::Text, _) => {
                out.push(ch);
                State::Text
            }
            (State::Escape, '[') => State::Csi,
            (State::Escape, ']') => State::Osc,
            (State::Escape, '(' | ')' | '*' | '+') => State::Charset,
            // Single-character escape (RIS, IND, ...): swallow it.
            (State::Escape, _) => State::Text,
            // CSI runs until a final byte in '@'..='~'.
            (State::Csi, '@'..='~') => State::Text,
            (State::Csi, _) => State::Csi,
            (State::Osc, '\x07') => State::Text,
            (State::Osc, '\x1b') => State::OscEscape,
            (State::Osc, _) => State::Osc,
            (State::OscEscape, '\\') => State::Text,
            (State::OscEscape, _) => State::Osc,
            (State::Charset, _) => State::Text,
        };
    }
    out
}

/// Largest char boundary at or below `index`.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_ansi("hello world\n"), "hello world\n");
    }

    #[test]
    fn csi_color_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m text"), "green text");
    }

    #[test]
    fn cursor_movement_is_removed() {
        assert_eq!(strip_ansi("a\x1b[2J\x1b[1;1Hb"), "ab");
    }

    #[test]
    fn osc_title_bel_terminated() {
        assert_eq!(strip_ansi("\x1b]0;window title\x07rest"), "rest");
    }

    #[test]
    fn osc_title_st_terminated() {
        assert_eq!(strip_ansi("\x1b]0;title\x1b\\rest"), "rest");
    }

    #[test]
    fn charset_designation_is_removed() {
        assert_eq!(strip_ansi("\x1b(Bok"), "ok");
    }

    #[test]
    fn unterminated_sequence_swallows_tail() {
        assert_eq!(strip_ansi("before\x1b[38;5;2"), "before");
    }

    #[test]
    fn floor_char_boundary_respects_utf8() {
        let s = "a⠋b";
        // '⠋' is 3 bytes starting at index 1.
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 4), 4);
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }
}
