// ABOUTME: Container name synthesis for the namespaced-task backend.
// ABOUTME: Random alphabetic suffixes keep retried commands collision-free.

use rand::Rng;

use crate::config::CommandDetails;

pub(crate) const RANDOM_SUFFIX_LEN: usize = 6;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Uniform random string over [A-Za-z].
pub(crate) fn random_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Synthesize a container name from the caller identity tuple.
///
/// A failed or timed-out cleanup of a prior attempt must never block a rerun,
/// so every name carries a fresh random suffix. Identifiers cannot contain
/// consecutive hyphens; negative identity fields are folded to their absolute
/// value to keep the name syntactically valid.
pub(crate) fn container_name(details: &CommandDetails) -> String {
    format!(
        "chains-{}-{}-{}-{}",
        details.chain_executor_id.unsigned_abs(),
        details.executor_id.unsigned_abs(),
        details.result_id.unsigned_abs(),
        random_string(RANDOM_SUFFIX_LEN)
    )
}
