use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

/// Decides whether a candidate reproducer still triggers the original crash.
///
/// Implementations must answer consistently for the same text while a single
/// `minimize` call is running; the minimizer calls it repeatedly and never
/// concurrently. Any `Fn(&str) -> bool` is a validator.
pub trait CrashValidator {
    fn is_crashing(&self, candidate: &str) -> bool;
}

impl<F> CrashValidator for F
where
    F: Fn(&str) -> bool,
{
    fn is_crashing(&self, candidate: &str) -> bool {
        self(candidate)
    }
}

fn number_pattern() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"\b\d+\b").expect("static number pattern is valid"))
}

/// Shrinks crash reproducers with two single passes: greedy line deletion
/// followed by numeric shrinking.
///
/// Neither pass iterates to a fixed point, so running `minimize` on its own
/// output can occasionally shrink further.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReproducerMinimizer;

impl ReproducerMinimizer {
    pub fn new() -> Self {
        ReproducerMinimizer
    }

    /// Assumes `validator.is_crashing(original)` holds; the result then also
    /// crashes and is never longer than `original`.
    pub fn minimize<V>(&self, original: &str, validator: &V) -> String
    where
        V: CrashValidator + ?Sized,
    {
        let line_reduced = self.reduce_lines(original, validator);
        let reduced = self.reduce_numbers(line_reduced, validator);
        debug!(
            original_len = original.len(),
            minimized_len = reduced.len(),
            "reproducer minimized"
        );
        reduced
    }

    fn reduce_lines<V>(&self, text: &str, validator: &V) -> String
    where
        V: CrashValidator + ?Sized,
    {
        let mut lines: Vec<&str> = text.split('\n').collect();
        let mut i = 0;
        while i < lines.len() {
            let mut candidate_lines = lines.clone();
            candidate_lines.remove(i);
            let candidate = candidate_lines.join("\n");
            if validator.is_crashing(&candidate) {
                lines = candidate_lines;
            } else {
                i += 1;
            }
        }
        lines.join("\n")
    }

    fn reduce_numbers<V>(&self, mut text: String, validator: &V) -> String
    where
        V: CrashValidator + ?Sized,
    {
        let mut seen = HashSet::new();
        let numbers: Vec<String> = number_pattern()
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .filter(|n| seen.insert(n.clone()))
            .collect();

        for literal in numbers {
            for replacement in shrink_candidates(&literal) {
                let candidate = text.replacen(&literal, &replacement, 1);
                if validator.is_crashing(&candidate) {
                    text = candidate;
                    break;
                }
            }
        }
        text
    }
}

/// `1`, `n/2`, `n-1` for a literal `n > 1`, keeping only values below `n`.
/// Literals too wide for `u128` are shrunk with decimal string arithmetic.
fn shrink_candidates(literal: &str) -> Vec<String> {
    match literal.parse::<u128>() {
        Ok(value) if value > 1 => [1, value / 2, value - 1]
            .into_iter()
            .filter(|&c| c < value)
            .map(|c| c.to_string())
            .collect(),
        Ok(_) => Vec::new(),
        Err(_) if literal.bytes().all(|b| b.is_ascii_digit()) => {
            vec!["1".to_string(), halve_decimal(literal), decrement_decimal(literal)]
        }
        Err(_) => Vec::new(),
    }
}

fn halve_decimal(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len());
    let mut carry = 0u8;
    for b in digits.bytes() {
        let current = carry * 10 + (b - b'0');
        out.push(char::from(b'0' + current / 2));
        carry = current % 2;
    }
    strip_leading_zeros(out)
}

/// Only called with a value above `u128::MAX`, so it never borrows past the
/// first digit.
fn decrement_decimal(digits: &str) -> String {
    let mut bytes = digits.as_bytes().to_vec();
    for b in bytes.iter_mut().rev() {
        if *b == b'0' {
            *b = b'9';
        } else {
            *b -= 1;
            break;
        }
    }
    strip_leading_zeros(String::from_utf8_lossy(&bytes).into_owned())
}

fn strip_leading_zeros(digits: String) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers_in(s: &str) -> Vec<u128> {
        number_pattern()
            .find_iter(s)
            .filter_map(|m| m.as_str().parse().ok())
            .collect()
    }

    #[test]
    fn removes_every_line_not_needed_for_the_crash() {
        let minimizer = ReproducerMinimizer::new();
        let result = minimizer.minimize("a\nb\nCRASH\nc", &|s: &str| s.contains("CRASH"));
        assert_eq!(result, "CRASH");
    }

    #[test]
    fn shrinks_numbers_in_fixed_candidate_order() {
        let minimizer = ReproducerMinimizer::new();
        let predicate = |s: &str| numbers_in(s).iter().any(|n| *n >= 2);
        assert_eq!(minimizer.minimize("value=4", &predicate), "value=2");
    }

    #[test]
    fn prefers_one_when_it_still_crashes() {
        let minimizer = ReproducerMinimizer::new();
        let predicate = |s: &str| s.starts_with("mmap(");
        assert_eq!(minimizer.minimize("mmap(4096)", &predicate), "mmap(1)");
    }

    #[test]
    fn falls_back_to_decrement() {
        let minimizer = ReproducerMinimizer::new();
        // 1 and 50 are rejected, so the decrement is adopted.
        let predicate = |s: &str| numbers_in(s).iter().any(|n| *n >= 99);
        assert_eq!(minimizer.minimize("len=100", &predicate), "len=99");
    }

    #[test]
    fn already_minimal_input_is_a_fixed_point() {
        let minimizer = ReproducerMinimizer::new();
        let predicate = |s: &str| s == "CRASH";
        assert_eq!(minimizer.minimize("CRASH", &predicate), "CRASH");
    }

    #[test]
    fn numbers_not_smaller_are_left_alone() {
        let minimizer = ReproducerMinimizer::new();
        let predicate = |s: &str| s.contains("fd=0") && s.contains("len=1");
        assert_eq!(minimizer.minimize("fd=0 len=1", &predicate), "fd=0 len=1");
    }

    #[test]
    fn greedy_line_pass_keeps_individually_needed_lines() {
        let minimizer = ReproducerMinimizer::new();
        // Crashes while at least one of x/y survives; removing x alone is fine,
        // after that y becomes necessary.
        let predicate = |s: &str| s.contains("CRASH") && (s.contains('x') || s.contains('y'));
        assert_eq!(minimizer.minimize("x\ny\nCRASH", &predicate), "y\nCRASH");
    }

    #[test]
    fn numbers_are_enumerated_once_before_substitution() {
        let minimizer = ReproducerMinimizer::new();
        let predicate = |s: &str| numbers_in(s).iter().sum::<u128>() >= 6;
        // "8" is tried once and only its first occurrence is replaced.
        assert_eq!(minimizer.minimize("a=8 b=8", &predicate), "a=1 b=8");
    }

    #[test]
    fn result_still_crashes_and_never_grows() {
        let minimizer = ReproducerMinimizer::new();
        let inputs = [
            "r0 = open(&(0x7f0000000000)='./file0', 0x42, 0)\nwrite(r0, 1024)\nCRASH 77",
            "noise\n\nCRASH\n\n",
            "CRASH 12 34 56\n7",
        ];
        let predicate = |s: &str| s.contains("CRASH");
        for input in inputs {
            assert!(predicate(input));
            let result = minimizer.minimize(input, &predicate);
            assert!(predicate(&result), "minimized {input:?} lost the crash: {result:?}");
            assert!(result.len() <= input.len(), "{result:?} grew from {input:?}");
        }
    }

    #[test]
    fn literals_wider_than_u128_still_shrink() {
        let minimizer = ReproducerMinimizer::new();
        let huge = "1000000000000000000000000000000000000000000";
        assert!(huge.parse::<u128>().is_err());

        let half = "500000000000000000000000000000000000000000";
        let predicate = |s: &str| s.len() > 30;
        assert_eq!(
            minimizer.minimize(&format!("x={huge}"), &predicate),
            format!("x={half}")
        );

        let below = "999999999999999999999999999999999999999999";
        let predicate = |s: &str| s.starts_with("x=9");
        assert_eq!(
            minimizer.minimize(&format!("x={huge}"), &predicate),
            format!("x={below}")
        );
    }

    #[test]
    fn decimal_helpers_handle_borrows_and_odd_digits() {
        assert_eq!(
            halve_decimal("1000000000000000000000000000000000000001"),
            "500000000000000000000000000000000000000"
        );
        assert_eq!(
            decrement_decimal("1000000000000000000000000000000000000000"),
            "999999999999999999999999999999999999999"
        );
        assert_eq!(shrink_candidates("1"), Vec::<String>::new());
        assert_eq!(shrink_candidates("2"), vec!["1", "1", "1"]);
    }

    #[test]
    fn accepts_trait_objects() {
        let minimizer = ReproducerMinimizer::new();
        let validator: Box<dyn CrashValidator> = Box::new(|s: &str| s.contains("boom"));
        assert_eq!(minimizer.minimize("x\nboom", validator.as_ref()), "boom");
    }
}
