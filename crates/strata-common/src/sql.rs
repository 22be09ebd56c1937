/// Whether `name` can be spliced into SQL as a table name without quoting.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::is_identifier;

    #[test]
    fn accepts_plain_identifiers_only() {
        assert!(is_identifier("_strata_migrations"));
        assert!(is_identifier("T1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1ledger"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier("ledger; DROP TABLE users"));
        assert!(!is_identifier(&"a".repeat(65)));
    }
}
