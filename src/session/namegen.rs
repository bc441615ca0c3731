// ABOUTME: Human-readable run name generation
// ABOUTME: Produces adjective_scientist names unique within the history file

use uuid::Uuid;

use super::error::Result;
use super::history::HistoryFile;

const ADJECTIVES: &[&str] = &[
    "agitated", "amazing", "boring", "clever", "compassionate", "dreamy", "eager", "fervent",
    "festive", "gloomy", "happy", "jolly", "keen", "lonely", "mighty", "pensive", "quirky",
    "serene", "stoic", "zealous",
];

const SURNAMES: &[&str] = &[
    "archimedes", "bohr", "curie", "darwin", "euler", "fermi", "franklin", "galileo", "hopper",
    "kepler", "lovelace", "mcclintock", "mendel", "noether", "pasteur", "ride", "shannon",
    "turing", "volta", "wright",
];

/// Compose a `adjective_surname` run name from pseudo-random bytes.
pub fn random_name() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let surname = SURNAMES[bytes[1] as usize % SURNAMES.len()];
    format!("{}_{}", adjective, surname)
}

/// Generate a run name not yet present in history. Falls back to a numeric
/// suffix when the pool is exhausted by collisions.
pub fn unique_name(history: &HistoryFile) -> Result<String> {
    for _ in 0..10 {
        let candidate = random_name();
        if history.find_by_name(&candidate)?.is_empty() {
            return Ok(candidate);
        }
    }
    let base = random_name();
    let mut counter = 2;
    loop {
        let candidate = format!("{}_{}", base, counter);
        if history.find_by_name(&candidate)?.is_empty() {
            return Ok(candidate);
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_random_name_shape() {
        let name = random_name();
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(SURNAMES.contains(&parts[1]));
    }

    #[test]
    fn test_unique_name_avoids_history() {
        let dir = TempDir::new().unwrap();
        let history = HistoryFile::new(dir.path());
        let name = unique_name(&history).unwrap();
        assert!(!name.is_empty());
        assert!(history.find_by_name(&name).unwrap().is_empty());
    }
}
