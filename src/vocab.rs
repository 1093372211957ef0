use std::{collections::HashMap, fmt, str::FromStr};

use serde::Deserialize;

use crate::error::DatasetError;

const DIGITS: &str = "0123456789";
const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const PUNCTUATION: &str = r##"!"#$%&'()*+,-./:;<=>?@[\]^_`{|}~"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum VocabularyType {
    /// Digits and lowercase letters.
    #[default]
    Lowercase,
    /// Digits and letters of both cases.
    AllCases,
    /// Digits, letters and ASCII punctuation.
    AllCasesSymbols,
}

impl VocabularyType {
    fn symbols(self) -> String {
        match self {
            VocabularyType::Lowercase => [DIGITS, LOWERCASE].concat(),
            VocabularyType::AllCases => [DIGITS, LOWERCASE, UPPERCASE].concat(),
            VocabularyType::AllCasesSymbols => [DIGITS, LOWERCASE, UPPERCASE, PUNCTUATION].concat(),
        }
    }
}

impl FromStr for VocabularyType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOWERCASE" => Ok(VocabularyType::Lowercase),
            "ALLCASES" => Ok(VocabularyType::AllCases),
            "ALLCASES_SYMBOLS" => Ok(VocabularyType::AllCasesSymbols),
            other => Err(DatasetError::UnknownVocabulary(other.to_string())),
        }
    }
}

impl TryFrom<String> for VocabularyType {
    type Error = DatasetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for VocabularyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VocabularyType::Lowercase => "LOWERCASE",
            VocabularyType::AllCases => "ALLCASES",
            VocabularyType::AllCasesSymbols => "ALLCASES_SYMBOLS",
        })
    }
}

/// Character table used to encode transcriptions. The three special tokens
/// follow the regular symbols in the order `EOS`, `PAD`, `UNK`.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    symbols: Vec<char>,
    char2id: HashMap<char, i32>,
}

impl Vocabulary {
    pub fn new(voc_type: VocabularyType) -> Self {
        Self::from_symbols(voc_type.symbols().chars())
    }

    /// Builds a vocabulary from an arbitrary symbol list, e.g. a recognizer's
    /// key file. Duplicate symbols keep their first id.
    pub fn from_symbols(symbols: impl IntoIterator<Item = char>) -> Self {
        let mut char2id = HashMap::new();
        let mut table = Vec::new();
        for symbol in symbols {
            if !char2id.contains_key(&symbol) {
                char2id.insert(symbol, table.len() as i32);
                table.push(symbol);
            }
        }
        Self {
            symbols: table,
            char2id,
        }
    }

    /// Number of ids, special tokens included.
    pub fn len(&self) -> usize {
        self.symbols.len() + 3
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn eos(&self) -> i32 {
        self.symbols.len() as i32
    }

    pub fn pad(&self) -> i32 {
        self.eos() + 1
    }

    pub fn unk(&self) -> i32 {
        self.eos() + 2
    }

    pub fn id(&self, symbol: char) -> i32 {
        self.char2id.get(&symbol).copied().unwrap_or_else(|| self.unk())
    }

    /// Encodes `word` into exactly `max_len` ids: one id per character, then
    /// `EOS`, then `PAD`. Words that don't leave room for `EOS` are truncated
    /// and `EOS` takes the last slot.
    pub fn encode(&self, word: &str, max_len: usize) -> Vec<i32> {
        let mut ids = vec![self.pad(); max_len];
        if max_len == 0 {
            return ids;
        }
        let mut len = 0;
        for (slot, symbol) in ids.iter_mut().zip(word.chars()) {
            *slot = self.id(symbol);
            len += 1;
        }
        let word_len = word.chars().count();
        let eos_slot = if word_len > max_len - 1 { max_len - 1 } else { len };
        ids[eos_slot] = self.eos();
        ids
    }

    /// Inverse of [`Vocabulary::encode`], stopping at the first `EOS`. Unknown
    /// ids are skipped.
    pub fn decode(&self, ids: &[i32]) -> String {
        ids.iter()
            .take_while(|id| **id != self.eos())
            .filter_map(|id| usize::try_from(*id).ok())
            .filter_map(|id| self.symbols.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_layout() {
        let voc = Vocabulary::new(VocabularyType::Lowercase);
        assert_eq!(voc.len(), 36 + 3);
        assert_eq!(voc.id('0'), 0);
        assert_eq!(voc.id('a'), 10);
        assert_eq!(voc.id('z'), 35);
        assert_eq!(voc.eos(), 36);
        assert_eq!(voc.pad(), 37);
        assert_eq!(voc.unk(), 38);
        assert_eq!(voc.id('A'), voc.unk());
    }

    #[test]
    fn symbol_sets() {
        assert_eq!(Vocabulary::new(VocabularyType::AllCases).len(), 62 + 3);
        assert_eq!(Vocabulary::new(VocabularyType::AllCasesSymbols).len(), 94 + 3);
    }

    #[test]
    fn unknown_type_fails() {
        assert!(matches!(
            "UPPERCASE".parse::<VocabularyType>(),
            Err(DatasetError::UnknownVocabulary(name)) if name == "UPPERCASE"
        ));
        assert_eq!(
            "ALLCASES_SYMBOLS".parse::<VocabularyType>().unwrap(),
            VocabularyType::AllCasesSymbols
        );
    }

    #[test]
    fn encode_pads_after_eos() {
        let voc = Vocabulary::new(VocabularyType::Lowercase);
        let ids = voc.encode("hi", 6);
        assert_eq!(
            ids,
            vec![voc.id('h'), voc.id('i'), voc.eos(), voc.pad(), voc.pad(), voc.pad()]
        );
        assert_eq!(voc.decode(&ids), "hi");
    }

    #[test]
    fn encode_truncates_long_words() {
        let voc = Vocabulary::new(VocabularyType::Lowercase);
        let ids = voc.encode("abcdef", 4);
        assert_eq!(ids, vec![voc.id('a'), voc.id('b'), voc.id('c'), voc.eos()]);

        // exactly max_len - 1 characters still fits EOS at the end
        let ids = voc.encode("abc", 4);
        assert_eq!(ids, vec![voc.id('a'), voc.id('b'), voc.id('c'), voc.eos()]);
    }

    #[test]
    fn encode_maps_unknown_chars() {
        let voc = Vocabulary::new(VocabularyType::Lowercase);
        assert_eq!(voc.encode("a-b", 4), vec![10, voc.unk(), 11, voc.eos()]);
    }
}
