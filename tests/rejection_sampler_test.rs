//! Unit tests for RejectionSampler.

use nano_specdec::{softmax, Distribution, Error, RejectionSampler, Token, Verdict};

fn uniform(vocab_size: usize) -> Distribution {
    // Uniform logits (all zeros -> uniform after softmax)
    softmax(&vec![0.0; vocab_size]).unwrap()
}

fn peaked(vocab_size: usize, index: usize, logit: f32) -> Distribution {
    let mut logits = vec![0.0; vocab_size];
    logits[index] = logit;
    softmax(&logits).unwrap()
}

#[test]
fn test_sampler_creation() {
    let sampler = RejectionSampler::new();
    assert!(format!("{sampler:?}").contains("RejectionSampler"));

    let seeded = RejectionSampler::with_seed(42);
    assert!(format!("{seeded:?}").contains("RejectionSampler"));
}

#[test]
fn test_accept_all_when_same_distribution() {
    let mut sampler = RejectionSampler::with_seed(42);
    let vocab_size = 100;
    let d = uniform(vocab_size);

    // p == q everywhere, so min(1, q/p) = 1
    for token in [10, 20, 30, 40] {
        assert_eq!(RejectionSampler::acceptance_probability(token, &d, &d), 1.0);
        assert_eq!(sampler.accept(token, &d, &d), Verdict::Accepted);
    }
    assert!(sampler.sample(&d) < vocab_size as Token);
}

#[test]
fn test_reject_when_target_prefers_different() {
    let mut sampler = RejectionSampler::with_seed(42);

    // Draft strongly prefers token 0, target strongly prefers token 5
    let p = peaked(10, 0, 30.0);
    let q = peaked(10, 5, 30.0);

    assert_eq!(sampler.accept(0, &p, &q), Verdict::Rejected);
    // Residual puts essentially all its mass on the target's choice
    assert_eq!(sampler.resample(&q, &p).unwrap(), 5);
}

#[test]
fn test_rejection_at_second_position() {
    let mut sampler = RejectionSampler::with_seed(9);

    let agree = peaked(10, 1, 30.0);
    let p2 = peaked(10, 2, 30.0);
    let q2 = peaked(10, 7, 30.0);

    assert!(sampler.accept(1, &agree, &agree).is_accepted());
    assert!(!sampler.accept(2, &p2, &q2).is_accepted());
    assert_eq!(sampler.resample(&q2, &p2).unwrap(), 7);
}

#[test]
fn test_bonus_follows_target() {
    let mut sampler = RejectionSampler::with_seed(5);
    let q = peaked(10, 4, 30.0);

    for _ in 0..50 {
        assert_eq!(sampler.sample(&q), 4);
    }
}

#[test]
fn test_resample_vocabulary_mismatch() {
    let mut sampler = RejectionSampler::new();

    let result = sampler.resample(&uniform(12), &uniform(10));
    assert!(matches!(result, Err(Error::Numeric(_))));
}

#[test]
fn test_acceptance_rate_converges() {
    let p = Distribution::from_weights(vec![0.6, 0.3, 0.1]).unwrap();
    let q = Distribution::from_weights(vec![0.3, 0.3, 0.4]).unwrap();
    let mut sampler = RejectionSampler::with_seed(2024);

    for (token, expected) in [(0u32, 0.5), (1, 1.0), (2, 1.0)] {
        let trials = 20_000;
        let accepted = (0..trials)
            .filter(|_| sampler.accept(token, &p, &q) == Verdict::Accepted)
            .count();
        let rate = accepted as f64 / trials as f64;
        assert!(
            (rate - expected).abs() < 0.02,
            "token {token}: rate {rate}, expected {expected}"
        );
    }
}

#[test]
fn test_resampled_tokens_follow_residual() {
    // residual = max(q - p, 0) = [0, 0.1, 0.3] -> [0, 0.25, 0.75]
    let p = Distribution::from_weights(vec![0.6, 0.2, 0.2]).unwrap();
    let q = Distribution::from_weights(vec![0.2, 0.3, 0.5]).unwrap();
    let mut sampler = RejectionSampler::with_seed(77);

    let trials = 20_000;
    let mut counts = [0usize; 3];
    for _ in 0..trials {
        counts[sampler.resample(&q, &p).unwrap() as usize] += 1;
    }

    assert_eq!(counts[0], 0);
    let frac = counts[2] as f64 / trials as f64;
    assert!((frac - 0.75).abs() < 0.02, "frac = {frac}");
}

#[test]
fn test_reproducibility_with_seed() {
    let k = 4;
    let logits = |shift: f32| -> Vec<f32> { (0..50).map(|i| ((i as f32) * shift).sin()).collect() };
    let draft_probs: Vec<Distribution> = (0..k)
        .map(|i| softmax(&logits(0.3 + i as f32)).unwrap())
        .collect();
    let target_probs: Vec<Distribution> = (0..=k)
        .map(|i| softmax(&logits(0.7 + i as f32)).unwrap())
        .collect();
    let draft_tokens: Vec<Token> = vec![5, 10, 15, 20];

    // Same seed should give same decisions
    let run = |seed: u64| -> Vec<(Verdict, Token)> {
        let mut sampler = RejectionSampler::with_seed(seed);
        draft_tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| {
                let verdict = sampler.accept(token, &draft_probs[i], &target_probs[i]);
                let next = match verdict {
                    Verdict::Accepted => sampler.sample(&target_probs[i + 1]),
                    Verdict::Rejected => sampler.resample(&target_probs[i], &draft_probs[i]).unwrap(),
                };
                (verdict, next)
            })
            .collect()
    };

    assert_eq!(run(42), run(42));
}
