//! Domain Feature Extraction

use serde::Serialize;

/// TLDs with a track record of abuse; weighted above the 1.0 baseline.
const HIGH_RISK_TLDS: &[&str] = &[
    "xyz", "top", "click", "link", "work", "date", "racing", "stream", "gdn", "mom", "loan", "tk",
    "ml", "ga", "cf",
];

/// Weight applied to high-risk TLDs
pub const HIGH_RISK_TLD_WEIGHT: f64 = 1.5;
/// Baseline TLD weight
pub const DEFAULT_TLD_WEIGHT: f64 = 1.0;

/// Shannon entropy (base 2) over the byte frequency distribution.
#[inline]
pub fn shannon_entropy(s: &str) -> f64 {
    let data = s.as_bytes();
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

/// Statistical features of a bare domain name.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DomainFeatures {
    /// Full fingerprint length
    pub length: f64,
    /// Shannon entropy of the registrable stem
    pub entropy: f64,
    /// Digits / stem length
    pub digit_ratio: f64,
    /// Vowels / stem length
    pub vowel_ratio: f64,
    /// TLD reputation weight
    pub tld_weight: f64,
}

impl DomainFeatures {
    /// Extract features from a normalized fingerprint.
    pub fn from_domain(domain: &str) -> Self {
        let stem = registrable_stem(domain);
        let stem_len = stem.chars().count().max(1) as f64;

        let digits = stem.chars().filter(|c| c.is_ascii_digit()).count() as f64;
        let vowels = stem
            .chars()
            .filter(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
            .count() as f64;

        Self {
            length: domain.len() as f64,
            entropy: shannon_entropy(stem),
            digit_ratio: digits / stem_len,
            vowel_ratio: vowels / stem_len,
            tld_weight: tld_weight(domain),
        }
    }

    /// Fixed-order feature vector for the anomaly engine.
    pub fn to_vector(&self) -> [f64; 5] {
        [
            self.length,
            self.entropy,
            self.digit_ratio,
            self.vowel_ratio,
            self.tld_weight,
        ]
    }
}

/// Everything left of the final label. Good enough as the registrable
/// portion without carrying a public-suffix list.
fn registrable_stem(domain: &str) -> &str {
    match domain.rfind('.') {
        Some(i) => &domain[..i],
        None => domain,
    }
}

/// Right-most label of the name.
pub fn tld_token(domain: &str) -> &str {
    domain.rsplit('.').next().unwrap_or(domain)
}

/// Reputation weight for the name's TLD.
pub fn tld_weight(domain: &str) -> f64 {
    if HIGH_RISK_TLDS.contains(&tld_token(domain)) {
        HIGH_RISK_TLD_WEIGHT
    } else {
        DEFAULT_TLD_WEIGHT
    }
}
