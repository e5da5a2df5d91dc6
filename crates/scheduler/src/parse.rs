//! Parsing of model replies: CSV name lists.
//!
//! Models regularly preface the requested CSV with prose, so only the last
//! blank-line-separated block is considered, and decorations (backticks,
//! quotes, bullet stars) are stripped from each name.

pub fn parse_csv_names(response: &str) -> Vec<String> {
    let block = response.trim().rsplit("\n\n").next().unwrap_or("").trim();
    block
        .split([',', '\n'])
        .map(|part| part.trim().trim_matches(['`', '"', '\'', '*', '-']).trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_csv_names;

    #[test]
    fn plain_csv_line() {
        assert_eq!(parse_csv_names("Elara, Grak, Anya"), vec!["Elara", "Grak", "Anya"]);
    }

    #[test]
    fn takes_last_block_after_explanations() {
        let response = "Let me think about who should be active.\n\nElara, Grak";
        assert_eq!(parse_csv_names(response), vec!["Elara", "Grak"]);
    }

    #[test]
    fn strips_decorations() {
        assert_eq!(parse_csv_names("`Elara`, \"Grak\""), vec!["Elara", "Grak"]);
    }

    #[test]
    fn newline_separated_names_also_parse() {
        assert_eq!(parse_csv_names("Elara\nGrak"), vec!["Elara", "Grak"]);
    }

    #[test]
    fn empty_response_yields_nothing() {
        assert!(parse_csv_names("").is_empty());
        assert!(parse_csv_names("   \n  ").is_empty());
    }
}
