//! Turns narration text into an ordered list of synthesis instructions.
//!
//! The text is processed line by line. A blank line becomes a pause. A
//! non-empty line may open with a speaker cue (`[Name]`, or a line holding
//! only a known name, optionally followed by `:`) that switches the active
//! voice; whatever text remains is spoken in the active voice, split into
//! segments no longer than the configured limit.

use log::debug;
use std::time::Duration;

use crate::services::voice::{VoiceMap, DEFAULT_VOICE, NARRATOR_CUE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakerState {
    NoActiveSpeaker,
    ActiveVoice(String),
}

impl SpeakerState {
    pub fn voice(&self) -> Option<&str> {
        match self {
            SpeakerState::NoActiveSpeaker => None,
            SpeakerState::ActiveVoice(name) => Some(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `voice: None` means the default voice.
    Speak { voice: Option<String>, text: String },
    Silence(Duration),
}

pub struct ScriptEngine {
    voices: VoiceMap,
    max_segment_chars: usize,
    blank_line_silence: Duration,
    state: SpeakerState,
}

impl ScriptEngine {
    pub fn new(voices: VoiceMap, max_segment_chars: usize, blank_line_silence: Duration) -> Self {
        Self {
            voices,
            max_segment_chars: max_segment_chars.max(1),
            blank_line_silence,
            state: SpeakerState::NoActiveSpeaker,
        }
    }

    pub fn voices(&self) -> &VoiceMap {
        &self.voices
    }

    pub fn state(&self) -> &SpeakerState {
        &self.state
    }

    /// Forgets the active speaker. Called between units unless the voice is
    /// carried across units.
    pub fn reset(&mut self) {
        self.state = SpeakerState::NoActiveSpeaker;
    }

    pub fn segment(&mut self, narration: &str) -> Vec<Instruction> {
        let mut instructions = Vec::new();

        for raw_line in narration.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                push_silence(&mut instructions, self.blank_line_silence);
                continue;
            }

            let spoken = self.consume_cues(line);
            if spoken.is_empty() {
                continue;
            }

            let voice = self.state.voice().map(str::to_string);
            for text in split_bounded(spoken, self.max_segment_chars) {
                instructions.push(Instruction::Speak {
                    voice: voice.clone(),
                    text,
                });
            }
        }

        instructions
    }

    /// Applies any speaker cue at the start of `line` and returns the text
    /// left to speak.
    fn consume_cues<'a>(&mut self, line: &'a str) -> &'a str {
        let mut rest = line;

        while let Some(tagged) = rest.strip_prefix('[') {
            let Some(close) = tagged.find(']') else {
                break;
            };
            let Some(state) = self.cue_state(&tagged[..close]) else {
                // Unknown tags are spoken as written.
                break;
            };
            debug!("Switching to voice: {}", state.voice().unwrap_or(DEFAULT_VOICE));
            self.state = state;
            rest = tagged[close + 1..].trim_start();
        }

        if rest.len() == line.len() {
            if let Some(name) = implicit_cue_name(line) {
                if let Some(state) = self.cue_state(name) {
                    debug!(
                        "Switching to voice: {} (implicit cue)",
                        state.voice().unwrap_or(DEFAULT_VOICE)
                    );
                    self.state = state;
                    return "";
                }
            }
        }

        rest
    }

    /// State a cue switches to. `Narrator` and the default voice both mean
    /// no active speaker, unless `Narrator` has a voice of its own.
    fn cue_state(&self, name: &str) -> Option<SpeakerState> {
        match self.voices.resolve(name) {
            Some(DEFAULT_VOICE) => Some(SpeakerState::NoActiveSpeaker),
            Some(voice) => Some(SpeakerState::ActiveVoice(voice.to_string())),
            None if name.trim().eq_ignore_ascii_case(NARRATOR_CUE) => {
                Some(SpeakerState::NoActiveSpeaker)
            }
            None => None,
        }
    }
}

fn push_silence(instructions: &mut Vec<Instruction>, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    if let Some(Instruction::Silence(existing)) = instructions.last_mut() {
        *existing += duration;
    } else {
        instructions.push(Instruction::Silence(duration));
    }
}

/// A line consisting only of one or two capitalized words, optionally
/// followed by a colon.
fn implicit_cue_name(line: &str) -> Option<&str> {
    let name = line.trim_end().trim_end_matches(':').trim_end();
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.is_empty() || words.len() > 2 {
        return None;
    }
    let capitalized = |word: &str| {
        let mut chars = word.chars();
        matches!(chars.next(), Some(c) if c.is_uppercase())
            && chars.all(|c| c.is_lowercase())
    };
    if words.iter().all(|w| capitalized(w)) {
        Some(name)
    } else {
        None
    }
}

/// Splits text into pieces of at most `max_chars` characters.
///
/// Whole sentences are packed greedily. A sentence that is too long on its
/// own is split between words, and a single word that is too long between
/// characters.
pub fn split_bounded(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    for sentence in split_sentences(text) {
        if char_len(sentence) <= max_chars {
            pieces.push(sentence.to_string());
        } else {
            for word in sentence.split_whitespace() {
                if char_len(word) <= max_chars {
                    pieces.push(word.to_string());
                } else {
                    let chars: Vec<char> = word.chars().collect();
                    pieces.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
                }
            }
        }
    }

    pack(pieces, max_chars)
}

fn pack(pieces: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for piece in pieces {
        let piece_len = char_len(&piece);
        if current.is_empty() {
            current = piece;
            current_len = piece_len;
        } else if current_len + 1 + piece_len <= max_chars {
            current.push(' ');
            current.push_str(&piece);
            current_len += 1 + piece_len;
        } else {
            segments.push(std::mem::take(&mut current));
            current = piece;
            current_len = piece_len;
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Sentences end at `.`, `!`, `?` or `…` (plus any closing quotes or
/// brackets) followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '…') {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '…' | '"' | '\'' | '”' | '’' | ')' | ']') {
                chars.next();
            } else {
                break;
            }
        }
        if let Some(&(pos, next)) = chars.peek() {
            if next.is_whitespace() {
                let sentence = text[start..pos].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = pos;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rewrite::{clean_narration, RewriteConfig};
    use crate::services::voice::tests::map;

    fn engine(names: &[&str], max: usize) -> ScriptEngine {
        ScriptEngine::new(map(names), max, Duration::from_millis(300))
    }

    fn spoken(instructions: &[Instruction]) -> Vec<(Option<&str>, &str)> {
        instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Speak { voice, text } => Some((voice.as_deref(), text.as_str())),
                Instruction::Silence(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_voice_persists_until_next_cue() {
        let mut engine = engine(&["default", "A", "B"], 250);
        let out = engine.segment("[A] Hello.\nGeneral narration.\n[B] Reply.");
        assert_eq!(
            spoken(&out),
            vec![
                (Some("A"), "Hello."),
                (Some("A"), "General narration."),
                (Some("B"), "Reply."),
            ]
        );
    }

    #[test]
    fn test_no_cue_uses_default_voice() {
        let mut engine = engine(&["default"], 250);
        let out = engine.segment("Once upon a time.");
        assert_eq!(spoken(&out), vec![(None, "Once upon a time.")]);
        assert_eq!(engine.state(), &SpeakerState::NoActiveSpeaker);
    }

    #[test]
    fn test_unknown_tag_is_literal_text() {
        let mut engine = engine(&["default", "Anna"], 250);
        let out = engine.segment("[Anna] [laughs] That is funny.\n[scary voice] Boo.");
        assert_eq!(
            spoken(&out),
            vec![
                (Some("Anna"), "[laughs] That is funny."),
                (Some("Anna"), "[scary voice] Boo."),
            ]
        );
    }

    #[test]
    fn test_tag_only_line_emits_nothing() {
        let mut engine = engine(&["default", "Vytautas"], 250);
        let out = engine.segment("[Vytautas]\nThey are at the gates.");
        assert_eq!(out.len(), 1);
        assert_eq!(spoken(&out), vec![(Some("Vytautas"), "They are at the gates.")]);
    }

    #[test]
    fn test_narrator_cue_returns_to_default_voice() {
        let raw = "[Anna]\nWho is there?\n[Narrator]\nThe night fell silent.\n\nNarrator:\n[Anna] Me.\n[narrator] Quiet again.";
        let cleaned = clean_narration(raw, &RewriteConfig::default().keep_tags);
        let mut engine = engine(&["default", "Anna"], 250);
        let out = engine.segment(&cleaned);
        assert_eq!(
            spoken(&out),
            vec![
                (Some("Anna"), "Who is there?"),
                (None, "The night fell silent."),
                (Some("Anna"), "Me."),
                (None, "Quiet again."),
            ]
        );
        assert_eq!(engine.state(), &SpeakerState::NoActiveSpeaker);
    }

    #[test]
    fn test_narrator_with_own_voice_is_a_speaker() {
        let mut engine = engine(&["default", "Narrator"], 250);
        let out = engine.segment("[Narrator]\nIt began.");
        assert_eq!(spoken(&out), vec![(Some("Narrator"), "It began.")]);
    }

    #[test]
    fn test_implicit_cue() {
        let mut engine = engine(&["default", "Kestutis", "Old Man"], 250);
        let out = engine.segment("Kestutis:\nHave the envoys arrived?\nOld Man\nNot yet.\nNobody\n");
        assert_eq!(
            spoken(&out),
            vec![
                (Some("Kestutis"), "Have the envoys arrived?"),
                (Some("Old Man"), "Not yet."),
                (Some("Old Man"), "Nobody"),
            ]
        );
    }

    #[test]
    fn test_blank_lines_become_silence() {
        let mut engine = engine(&["default"], 250);
        let out = engine.segment("First.\n\n\nSecond.");
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], Instruction::Silence(Duration::from_millis(600)));
    }

    #[test]
    fn test_state_carries_until_reset() {
        let mut engine = engine(&["default", "A"], 250);
        engine.segment("[A] Hello.");
        let carried = engine.segment("Still A.");
        assert_eq!(spoken(&carried), vec![(Some("A"), "Still A.")]);

        engine.reset();
        let fresh = engine.segment("Narrator again.");
        assert_eq!(spoken(&fresh), vec![(None, "Narrator again.")]);
    }

    #[test]
    fn test_segments_respect_bound_and_preserve_text() {
        let text = "The night was long. Wind howled across the frozen marsh and the sentries \
                    huddled close to their fires! Would dawn ever come? Nobody knew. \
                    Supercalifragilisticexpialidociousnessforeverandever is a long word.";
        for max in [12, 25, 40, 80] {
            let segments = split_bounded(text, max);
            assert!(segments.iter().all(|s| s.chars().count() <= max), "max {}", max);

            let rejoined: String = segments.concat().split_whitespace().collect();
            let original: String = text.split_whitespace().collect();
            assert_eq!(rejoined, original);
        }
    }

    #[test]
    fn test_sentences_packed_greedily() {
        let segments = split_bounded("One. Two. Three. Four.", 10);
        assert_eq!(segments, vec!["One. Two.", "Three.", "Four."]);
    }

    #[test]
    fn test_long_line_split_keeps_voice() {
        let mut engine = engine(&["default", "A"], 20);
        let out = engine.segment("[A] This is a sentence. And this is another one.");
        let spoken = spoken(&out);
        assert_eq!(spoken.len(), 3);
        assert!(spoken.iter().all(|(v, t)| *v == Some("A") && t.chars().count() <= 20));
    }
}
