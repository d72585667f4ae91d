//! Command-line tokenization for response files.

/// Split one line of a response file into arguments.
///
/// Whitespace separates tokens; double and single quotes group them; a
/// backslash escapes the next character outside single quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        if next != '"' && next != '\\' {
                            current.push('\\');
                        }
                        current.push(next);
                    } else {
                        current.push('\\');
                    }
                }
                _ => current.push(c),
            },
            None => match c {
                ' ' | '\t' | '\r' | '\n' => {
                    if in_token {
                        out.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    in_token = true;
                    if let Some(next) = chars.next() {
                        current.push(next);
                    } else {
                        current.push('\\');
                    }
                }
                _ => {
                    in_token = true;
                    current.push(c);
                }
            },
            _ => unreachable!(),
        }
    }
    if in_token {
        out.push(current);
    }
    out
}
