use rand::{rngs::OsRng, Rng};
use regex::Regex;
use std::sync::OnceLock;

pub struct CodeGenerator;

impl CodeGenerator {
    /// Generate a random six-letter lowercase session code (aaaaaa-zzzzzz).
    /// Collision handling against live sessions is the store's job.
    pub fn generate() -> String {
        (0..6)
            .map(|_| OsRng.gen_range(b'a'..=b'z') as char)
            .collect()
    }
}

pub fn is_valid_session_code(code: &str) -> bool {
    static CODE_RE: OnceLock<Regex> = OnceLock::new();
    CODE_RE
        .get_or_init(|| Regex::new(r"^[a-z]{6}$").expect("session code regex"))
        .is_match(code)
}
