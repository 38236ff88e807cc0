//! Random tokens for result ids, job ids and upload handles

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric string of `len` characters
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
