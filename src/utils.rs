use std::f64::consts::LN_10;

/// Lowest MIDI note `mtof`/`ftom` will map to a frequency.
const MIDI_FLOOR: f64 = -1500.0;
const MIDI_CEIL: f64 = 1499.0;

/// Returns true if `n` is a non-zero power of two.
pub fn is_pow2(n: u64) -> bool {
    n.is_power_of_two()
}

/// The power of two directly above the highest set bit of `n`.
///
/// Note that a power of two maps to the *next* one (`256 -> 512`), and `0`
/// maps to `0`. Use [`ensure_pow2`] to round a buffer size.
pub fn next_pow2(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let highest = 1u64 << (63 - n.leading_zeros());
    highest.saturating_mul(2)
}

/// Smallest power of two that is `>= n`. Sizes that already are a power of
/// two are returned unchanged; `0` becomes `1`.
pub fn ensure_pow2(n: u64) -> u64 {
    n.max(1).checked_next_power_of_two().unwrap_or(1 << 63)
}

/// MIDI note number to frequency in Hz.
pub fn mtof(f: f64) -> f64 {
    if f <= MIDI_FLOOR {
        0.0
    } else if f > MIDI_CEIL {
        mtof(MIDI_CEIL)
    } else {
        8.17579891564 * (0.0577622650 * f).exp()
    }
}

/// Frequency in Hz to MIDI note number.
pub fn ftom(f: f64) -> f64 {
    if f > 0.0 {
        17.3123405046 * (0.12231220585 * f).ln()
    } else {
        MIDI_FLOOR
    }
}

/// Power to decibels, where a power of 1.0 is 100 dB.
pub fn powtodb(f: f64) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    (100.0 + 10.0 / LN_10 * f.ln()).max(0.0)
}

/// RMS amplitude to decibels, where an amplitude of 1.0 is 100 dB.
pub fn rmstodb(f: f64) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    (100.0 + 20.0 / LN_10 * f.ln()).max(0.0)
}

pub fn dbtopow(f: f64) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    ((LN_10 * 0.1) * (f.min(870.0) - 100.0)).exp()
}

pub fn dbtorms(f: f64) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    ((LN_10 * 0.05) * (f.min(485.0) - 100.0)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ensure_pow2_rounds_up_only_when_needed() {
        assert_eq!(ensure_pow2(300), 512);
        assert_eq!(ensure_pow2(256), 256);
        assert_eq!(ensure_pow2(1), 1);
        assert_eq!(ensure_pow2(0), 1);
        assert_eq!(ensure_pow2(257), 512);
    }

    #[test]
    fn next_pow2_always_moves_past_the_top_bit() {
        assert_eq!(next_pow2(300), 512);
        assert_eq!(next_pow2(256), 512);
        assert_eq!(next_pow2(1), 2);
        assert_eq!(next_pow2(0), 0);
        assert!(is_pow2(next_pow2(12345)));
    }

    #[test]
    fn midi_conversions() {
        assert_relative_eq!(mtof(69.0), 440.0, max_relative = 1e-6);
        assert_relative_eq!(ftom(440.0), 69.0, max_relative = 1e-6);
        assert_eq!(mtof(-2000.0), 0.0);
        assert_eq!(ftom(0.0), -1500.0);
        assert_eq!(mtof(5000.0), mtof(1499.0));
    }

    #[test]
    fn decibel_conversions() {
        assert_relative_eq!(powtodb(1.0), 100.0);
        assert_relative_eq!(rmstodb(1.0), 100.0);
        assert_relative_eq!(dbtopow(100.0), 1.0);
        assert_relative_eq!(dbtorms(100.0), 1.0);
        assert_relative_eq!(rmstodb(0.5), 93.979_400_086_720_38, max_relative = 1e-9);
        assert_relative_eq!(dbtorms(rmstodb(0.25)), 0.25, max_relative = 1e-9);
        assert_eq!(powtodb(-1.0), 0.0);
        assert_eq!(dbtorms(0.0), 0.0);
        assert_eq!(powtodb(1e-20), 0.0);
    }
}
