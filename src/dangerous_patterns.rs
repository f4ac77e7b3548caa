//! Static pre-execution scan (C12 step 1): a cheap textual check for
//! snippet patterns that almost certainly indicate an attempt to step
//! outside the sandbox contract rather than use it. Not a security boundary
//! by itself — bearer-token auth at the brokers and the child's lack of
//! ambient environment are that — this just fails fast with a clear message
//! instead of spawning a child that was always going to misbehave.

/// One matched pattern and the human-readable reason it was flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub pattern: &'static str,
    pub reason: &'static str,
}

const PATTERNS: &[(&str, &str)] = &[
    ("require('child_process')", "direct subprocess spawning bypasses the broker contract"),
    ("require(\"child_process\")", "direct subprocess spawning bypasses the broker contract"),
    ("import subprocess", "direct subprocess spawning bypasses the broker contract"),
    ("os.system(", "direct shell execution bypasses the broker contract"),
    ("/proc/self/environ", "reading process environment bypasses the no-ambient-env-vars contract"),
    ("__PTC_", "snippet references reserved preamble identifiers directly"),
];

/// Returns every pattern found in `code`, in catalog order. Callers treat a
/// non-empty result as `BadArguments` unless the caller opted out via
/// `skipDangerousPatternCheck`.
pub fn scan(code: &str) -> Vec<Match> {
    PATTERNS
        .iter()
        .filter(|(pattern, _)| code.contains(pattern))
        .map(|(pattern, reason)| Match { pattern, reason })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_snippet_has_no_matches() {
        assert!(scan("const r = await callTool('prefix__fs__read_file', {path:'/tmp/x'});").is_empty());
    }

    #[test]
    fn subprocess_import_is_flagged() {
        let matches = scan("import subprocess\nsubprocess.run(['ls'])");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern, "import subprocess");
    }

    #[test]
    fn reserved_identifier_reference_is_flagged() {
        let matches = scan("console.log(__PTC_TOOL_CALL_TOKEN)");
        assert_eq!(matches.len(), 1);
    }
}
