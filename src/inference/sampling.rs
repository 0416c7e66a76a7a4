use crate::inference::types::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

/// A drawn token and its probability under the temperature-scaled distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub token: TokenId,
    pub probability: f32,
}

/// Next-token sampler.
///
/// Order: temperature scaling, softmax, top-p truncation to the smallest set
/// whose cumulative probability reaches `top_p`, renormalization, draw.
/// A temperature `<= 0` is greedy argmax and never touches the RNG.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// `seed == 0` derives a seed from the clock
    #[must_use]
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        let seed = if seed == 0 { clock_seed() } else { seed };
        Self {
            temperature,
            top_p: top_p.clamp(f32::MIN_POSITIVE, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Pick the next token; `None` when no logit is finite
    pub fn sample(&mut self, logits: &[f32]) -> Option<Sample> {
        if self.is_greedy() {
            return greedy(logits);
        }

        let mut candidates = softmax(logits, self.temperature);
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_unstable_by(|a, b| b.probability.total_cmp(&a.probability));

        let mut cumulative = 0.0;
        let mut keep = candidates.len();
        for (i, candidate) in candidates.iter().enumerate() {
            cumulative += candidate.probability;
            if cumulative >= self.top_p {
                keep = i + 1;
                break;
            }
        }
        let nucleus = &candidates[..keep];
        let total: f32 = nucleus.iter().map(|c| c.probability).sum();

        let mut threshold = self.rng.gen::<f32>() * total;
        for candidate in nucleus {
            threshold -= candidate.probability;
            if threshold <= 0.0 {
                return Some(*candidate);
            }
        }
        nucleus.last().copied()
    }
}

fn greedy(logits: &[f32]) -> Option<Sample> {
    let (best, _) = finite(logits).max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let probability = softmax(logits, 1.0)
        .into_iter()
        .find(|s| s.token == best)
        .map_or(1.0, |s| s.probability);

    Some(Sample {
        token: best,
        probability,
    })
}

fn finite(logits: &[f32]) -> impl Iterator<Item = (TokenId, f32)> + '_ {
    (0..)
        .zip(logits.iter().copied())
        .filter(|(_, logit)| logit.is_finite())
}

/// Probabilities of the finite logits scaled by `1 / temperature`
fn softmax(logits: &[f32], temperature: f32) -> Vec<Sample> {
    let max = finite(logits).map(|(_, l)| l).fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Vec::new();
    }

    let mut samples: Vec<Sample> = finite(logits)
        .map(|(token, logit)| Sample {
            token,
            probability: ((logit - max) / temperature).exp(),
        })
        .collect();
    let sum: f32 = samples.iter().map(|s| s.probability).sum();
    for sample in &mut samples {
        sample.probability /= sum;
    }
    samples
}

#[allow(clippy::cast_possible_truncation)]
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0x5eed, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::new(0.0, 0.9, 1);
        let sample = sampler.sample(&[0.1, 2.0, 1.0]).unwrap();
        assert_eq!(sample.token, 1);
        assert!(sample.probability > 0.5 && sample.probability < 1.0);
    }

    #[test]
    fn test_negative_temperature_is_greedy() {
        let mut sampler = Sampler::new(-1.0, 0.9, 1);
        assert!(sampler.is_greedy());
        assert_eq!(sampler.sample(&[3.0, 2.0]).unwrap().token, 0);
    }

    #[test]
    fn test_non_finite_logits_are_ignored() {
        let mut sampler = Sampler::new(0.0, 1.0, 1);
        let sample = sampler.sample(&[f32::NAN, 1.0, f32::INFINITY]).unwrap();
        assert_eq!(sample.token, 1);
        assert!(sampler.sample(&[f32::NAN, f32::NEG_INFINITY]).is_none());
        assert!(sampler.sample(&[]).is_none());

        let mut hot = Sampler::new(1.0, 1.0, 1);
        assert!(hot.sample(&[f32::NAN]).is_none());
    }

    #[test]
    fn test_small_top_p_keeps_only_best() {
        let mut sampler = Sampler::new(1.0, 0.05, 7);
        for _ in 0..50 {
            assert_eq!(sampler.sample(&[0.0, 5.0, 1.0, 0.5]).unwrap().token, 1);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let logits: Vec<f32> = (0..64u8).map(|i| f32::from(i % 7)).collect();
        let mut a = Sampler::new(0.8, 0.95, 42);
        let mut b = Sampler::new(0.8, 0.95, 42);
        for _ in 0..100 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn test_softmax_normalizes() {
        let probs = softmax(&[1.0, 2.0, 3.0], 0.5);
        let sum: f32 = probs.iter().map(|s| s.probability).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2].probability > probs[1].probability);
    }
}
