//! Soundex phonetic codes.

/// Compute the four-character Soundex code for a name.
///
/// Empty or non-alphabetic-leading input yields `"0000"` so callers can
/// compare codes without special-casing missing data.
pub fn soundex(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    let mut chars = upper.chars().filter(|c| c.is_ascii_alphabetic());
    let Some(first) = chars.next() else {
        return "0000".to_string();
    };

    let mut result = String::with_capacity(4);
    result.push(first);
    for c in chars {
        if let Some(code) = digit_for(c) {
            // Consecutive duplicates collapse to one digit.
            if result.chars().last() != Some(code) {
                result.push(code);
            }
        }
    }

    let mut padded: String = result
        .chars()
        .enumerate()
        .filter(|(i, c)| *i == 0 || c.is_ascii_digit())
        .map(|(_, c)| c)
        .collect();
    while padded.len() < 4 {
        padded.push('0');
    }
    padded.truncate(4);
    padded
}

fn digit_for(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}
