//! Seeded random generators shared across the workspace.
//!
//! Three generators are reseeded together by [`set_seed`]:
//!
//! * the host generator, for general sampling on the CPU side;
//! * the dropout generator, which draws the keep/drop masks in `layers`;
//! * the device generator owned by candle, when the backend supports seeding.
//!
//! Both host-side generators start from entropy until the first call to
//! [`set_seed`].

use std::sync::{Mutex, MutexGuard, OnceLock};

use candle_core::Device;
use rand::{rngs::StdRng, SeedableRng};

static HOST_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
static DROPOUT_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn slot(cell: &'static OnceLock<Mutex<StdRng>>) -> MutexGuard<'static, StdRng> {
    cell.get_or_init(|| Mutex::new(StdRng::from_entropy()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs `f` with exclusive access to the host generator.
pub fn with_host_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut guard = slot(&HOST_RNG);
    f(&mut guard)
}

/// Runs `f` with exclusive access to the dropout generator.
pub fn with_dropout_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut guard = slot(&DROPOUT_RNG);
    f(&mut guard)
}

/// Reseeds every generator so subsequent draws are reproducible.
///
/// Backends that cannot be seeded (candle's CPU backend among them) only
/// produce a warning; the host and dropout generators are reseeded regardless.
pub fn set_seed(seed: u64, device: &Device) {
    *slot(&HOST_RNG) = StdRng::seed_from_u64(seed);
    *slot(&DROPOUT_RNG) = StdRng::seed_from_u64(seed);
    if let Err(err) = device.set_seed(seed) {
        log::warn!("failed to seed device RNG: {err}");
    }
    log::debug!("seeded host, dropout and device generators with {seed}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draw(n: usize) -> (Vec<u64>, Vec<f32>) {
        let host = with_host_rng(|rng| (0..n).map(|_| rng.gen::<u64>()).collect());
        let dropout = with_dropout_rng(|rng| (0..n).map(|_| rng.gen::<f32>()).collect());
        (host, dropout)
    }

    // Kept as a single test: the generators are process-global.
    #[test]
    fn same_seed_reproduces_every_generator() {
        set_seed(42, &Device::Cpu);
        let first = draw(16);
        set_seed(42, &Device::Cpu);
        let second = draw(16);
        assert_eq!(first, second);

        set_seed(43, &Device::Cpu);
        let third = draw(16);
        assert_ne!(first.0, third.0);
        assert_ne!(first.1, third.1);
    }
}
