/// Replace `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// Unresolvable variables without a fallback are left as-is so validation
/// can point at them.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// [`substitute_env`] with an injectable lookup, so tests do not touch the
/// process environment.
pub(crate) fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated, emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match lookup(name).filter(|value| !value.is_empty()) {
            Some(value) if !name.is_empty() => out.push_str(&value),
            _ => match fallback {
                Some(fallback) if !name.is_empty() => out.push_str(fallback),
                _ => {
                    out.push_str("${");
                    out.push_str(body);
                    out.push('}');
                },
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn lookup(name: &str) -> Option<String> {
        match name {
            "COURIER_TEST_PREFIX" => Some("[bot] ".to_string()),
            "COURIER_EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[rstest]
    #[case("prefix = \"${COURIER_TEST_PREFIX}\"", "prefix = \"[bot] \"")]
    #[case("${COURIER_MISSING}", "${COURIER_MISSING}")]
    #[case("${COURIER_MISSING:-4}", "4")]
    #[case("${COURIER_EMPTY:-fallback}", "fallback")]
    #[case("${COURIER_TEST_PREFIX:-unused}", "[bot] ")]
    #[case("a ${unterminated", "a ${unterminated")]
    #[case("${}", "${}")]
    #[case("plain text", "plain text")]
    fn substitution(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
