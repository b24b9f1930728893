//! Keyword lexicon turning chat text into an emotion-space impact vector.

/// Channel names in emotion-vector order. Models with fewer dimensions use a prefix.
pub const CHANNELS: [&str; 10] = [
    "joy",
    "trust",
    "fear",
    "surprise",
    "sadness",
    "disgust",
    "anger",
    "anticipation",
    "curiosity",
    "calm",
];

const LEXICON: &[(&str, usize, f32)] = &[
    ("happy", 0, 0.8),
    ("great", 0, 0.6),
    ("love", 0, 0.9),
    ("thanks", 1, 0.6),
    ("thank", 1, 0.6),
    ("trust", 1, 0.8),
    ("friend", 1, 0.5),
    ("afraid", 2, 0.8),
    ("scared", 2, 0.8),
    ("danger", 2, 0.7),
    ("wow", 3, 0.7),
    ("suddenly", 3, 0.5),
    ("sad", 4, 0.8),
    ("sorry", 4, 0.4),
    ("lonely", 4, 0.7),
    ("gross", 5, 0.7),
    ("hate", 6, 0.9),
    ("angry", 6, 0.8),
    ("stupid", 6, 0.6),
    ("soon", 7, 0.4),
    ("tomorrow", 7, 0.4),
    ("why", 8, 0.5),
    ("how", 8, 0.3),
    ("curious", 8, 0.8),
    ("relax", 9, 0.7),
    ("calm", 9, 0.8),
];

const NEGATORS: &[&str] = &["not", "no", "never", "don't", "dont", "isn't"];
const INTENSIFIERS: &[&str] = &["very", "so", "really", "extremely"];

/// Impact of `text` on a `dim`-long emotion vector, each value in `[-1, 1]`.
pub fn impact_from_text(text: &str, dim: usize) -> Vec<f32> {
    let mut impact = vec![0.0f32; dim];
    let mut sign = 1.0f32;
    let mut gain = 1.0f32;

    for raw in text.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .flat_map(char::to_lowercase)
            .collect();
        if word.is_empty() {
            continue;
        }
        if NEGATORS.contains(&word.as_str()) {
            sign = -sign;
            continue;
        }
        if INTENSIFIERS.contains(&word.as_str()) {
            gain = (gain * 1.5).min(3.0);
            continue;
        }
        for &(key, channel, weight) in LEXICON {
            if key == word && channel < dim {
                impact[channel] += sign * gain * weight;
            }
        }
        sign = 1.0;
        gain = 1.0;
    }

    let bangs = text.chars().filter(|c| *c == '!').count().min(5) as f32;
    let amp = 1.0 + 0.1 * bangs;
    for v in impact.iter_mut() {
        *v = (*v * amp).clamp(-1.0, 1.0);
    }
    impact
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_land_on_their_channel() {
        let v = impact_from_text("I love you, friend", 10);
        assert!(v[0] > 0.8);
        assert!(v[1] > 0.4);
        assert_eq!(v[2], 0.0);
    }

    #[test]
    fn negation_flips_only_the_next_keyword() {
        let v = impact_from_text("not happy but calm", 10);
        assert!(v[0] < 0.0);
        assert!(v[9] > 0.0);
    }

    #[test]
    fn channels_beyond_dim_are_dropped_and_values_clamped() {
        let v = impact_from_text("so so so happy happy happy!!!", 3);
        assert_eq!(v.len(), 3);
        assert_eq!(v[0], 1.0);
        assert!(impact_from_text("calm", 3).iter().all(|x| *x == 0.0));
    }
}
