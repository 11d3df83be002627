use std::sync::OnceLock;

use rand::Rng;
use regex_lite::Regex;

use crate::config::{GifConfig, GifEntry};

/// Share of `[GIF:n]` answers that are actually sent; the rest ask the model
/// for a text reply instead.
const GIF_SEND_RATE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GifChoice {
    /// The reply was a gif marker; send this URL.
    Send(String),
    /// The reply was a gif marker but we decided against it; ask once more.
    Reroll,
    /// Ordinary text reply.
    NotGif,
}

fn marker_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\[GIF:(\d+)\]$").ok())
        .as_ref()
}

#[derive(Debug, Clone, Default)]
pub struct GifLibrary {
    enabled: bool,
    chance: f64,
    entries: Vec<GifEntry>,
}

impl GifLibrary {
    pub fn from_config(config: &GifConfig) -> Self {
        Self {
            enabled: config.enabled,
            chance: config.chance,
            entries: config.entries.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.entries.is_empty()
    }

    /// System-prompt section listing the available gifs, or empty when disabled.
    pub fn prompt_section(&self) -> String {
        if !self.is_active() {
            return String::new();
        }

        let mut prompt = String::from("\n\n--- GIF Responses ---\n");
        prompt.push_str(
            "You can respond with JUST a gif instead of text when it fits. \
             To use a gif, respond with only [GIF:X] where X is the number.\n",
        );
        prompt.push_str("Only use gifs occasionally when it really fits. Available gifs:\n");
        for (i, gif) in self.entries.iter().enumerate() {
            prompt.push_str(&format!("[GIF:{}] - {}\n", i, gif.context));
        }
        prompt
    }

    pub fn parse_reply<R: Rng + ?Sized>(&self, reply: &str, rng: &mut R) -> GifChoice {
        if !self.is_active() {
            return GifChoice::NotGif;
        }

        let index = marker_pattern()
            .and_then(|re| re.captures(reply.trim()))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok());

        match index.and_then(|i| self.entries.get(i)) {
            Some(entry) => {
                if rng.random::<f64>() <= GIF_SEND_RATE {
                    GifChoice::Send(entry.url.clone())
                } else {
                    GifChoice::Reroll
                }
            }
            None => GifChoice::NotGif,
        }
    }

    /// Keyword triggers found in either the incoming text or our reply can swap
    /// the reply for a gif, each match rolling against the configured chance.
    pub fn keyword_match<R: Rng + ?Sized>(
        &self,
        incoming: &str,
        reply: &str,
        rng: &mut R,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let combined = format!("{} {}", incoming, reply).to_lowercase();
        for gif in self.entries.iter().filter(|g| !g.url.is_empty()) {
            for trigger in &gif.triggers {
                if trigger.is_empty() || !combined.contains(&trigger.to_lowercase()) {
                    continue;
                }
                if rng.random::<f64>() <= self.chance {
                    return Some(gif.url.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn library(chance: f64) -> GifLibrary {
        GifLibrary::from_config(&GifConfig {
            enabled: true,
            chance,
            entries: vec![
                GifEntry {
                    url: "https://gifs.test/wave.gif".to_string(),
                    context: "saying hi".to_string(),
                    triggers: vec!["hello".to_string()],
                },
                GifEntry {
                    url: "https://gifs.test/shrug.gif".to_string(),
                    context: "not sure".to_string(),
                    triggers: vec![],
                },
            ],
        })
    }

    #[test]
    fn prompt_lists_entries_only_when_active() {
        let prompt = library(0.3).prompt_section();
        assert!(prompt.contains("[GIF:0] - saying hi"));
        assert!(prompt.contains("[GIF:1] - not sure"));

        assert!(GifLibrary::default().prompt_section().is_empty());
    }

    #[test]
    fn marker_parsing_sends_or_rerolls() {
        let lib = library(0.3);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(lib.parse_reply("hello there", &mut rng), GifChoice::NotGif);
        assert_eq!(lib.parse_reply("[GIF:9]", &mut rng), GifChoice::NotGif);
        assert_eq!(lib.parse_reply("sure [GIF:0]", &mut rng), GifChoice::NotGif);

        let mut sent = 0;
        let mut rerolled = 0;
        for _ in 0..1000 {
            match lib.parse_reply(" [GIF:1] ", &mut rng) {
                GifChoice::Send(url) => {
                    assert_eq!(url, "https://gifs.test/shrug.gif");
                    sent += 1;
                }
                GifChoice::Reroll => rerolled += 1,
                GifChoice::NotGif => panic!("marker must be recognised"),
            }
        }
        assert!(sent > 800 && rerolled > 30, "sent={sent} rerolled={rerolled}");
    }

    #[test]
    fn keyword_triggers_respect_chance() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            library(1.0).keyword_match("HELLO everyone", "", &mut rng),
            Some("https://gifs.test/wave.gif".to_string())
        );
        assert_eq!(library(1.0).keyword_match("bye", "see ya", &mut rng), None);
        assert_eq!(library(0.0).keyword_match("hello", "", &mut rng), None);
    }
}
