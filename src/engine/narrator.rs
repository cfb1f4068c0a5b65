use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::engine::SpeechSynth;

/// Spoken in place of blank text.
pub const PLACEHOLDER_PHRASE: &str = "Processing...";
/// Spoken when synthesis of the requested text failed.
pub const FALLBACK_PHRASE: &str = "Speech synthesis failed.";

/// Synthesized MP3 audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    data: Bytes,
}

impl AudioClip {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `data:` URL as consumed by the browser client, or `None` when the
    /// clip holds no audio.
    pub fn data_url(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(format!("data:audio/mp3;base64,{}", STANDARD.encode(&self.data)))
        }
    }
}

#[derive(Clone)]
pub struct Narrator {
    speech: Arc<dyn SpeechSynth>,
}

impl Narrator {
    pub fn new(speech: Arc<dyn SpeechSynth>) -> Self {
        Self { speech }
    }

    /// Never fails. Blank text is replaced by [`PLACEHOLDER_PHRASE`]; a failed
    /// synthesis is retried once with [`FALLBACK_PHRASE`]. Only if that also
    /// fails is an empty clip returned.
    pub async fn speak(&self, text: &str) -> AudioClip {
        let text = if text.trim().is_empty() {
            PLACEHOLDER_PHRASE
        } else {
            text
        };

        let mut phrase = text;
        let mut retried = false;
        loop {
            match self.speech.synthesize(phrase).await {
                Ok(data) => return AudioClip { data },
                Err(err) if !retried => {
                    tracing::error!("speech synthesis failed: {}", err);
                    phrase = FALLBACK_PHRASE;
                    retried = true;
                }
                Err(err) => {
                    tracing::error!("fallback speech synthesis failed: {}", err);
                    return AudioClip { data: Bytes::new() };
                }
            }
        }
    }
}
