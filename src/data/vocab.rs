use std::collections::HashMap;

use super::conll::{Sentence, Token};

pub const PAD: &str = "<PAD>";
pub const ROOT: &str = "<ROOT>";
pub const UNK: &str = "<UNK>";
pub const PAD_ID: usize = 0;
pub const ROOT_ID: usize = 1;
pub const UNK_ID: usize = 2;

/// Which CoNLL column(s) a vocabulary counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabColumn {
    Forms,
    /// UPOS and XPOS share one vocabulary.
    Tags,
    Rels,
}

impl VocabColumn {
    fn values(self, token: &Token) -> Vec<&str> {
        match self {
            Self::Forms => vec![token.form.as_str()],
            Self::Tags => vec![token.upos.as_str(), token.xpos.as_str()],
            Self::Rels => vec![token.deprel.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocab {
    name: String,
    cased: bool,
    id_to_str: Vec<String>,
    str_to_id: HashMap<String, usize>,
}

impl Vocab {
    /// Counts `column` over `sentences`; entries seen fewer than
    /// `min_occur_count` times are left out and map to `<UNK>`. Ids are
    /// assigned by descending count, ties broken alphabetically.
    pub fn from_sentences(
        name: &str,
        sentences: &[Sentence],
        column: VocabColumn,
        min_occur_count: usize,
        cased: bool,
    ) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in sentences.iter().flat_map(|s| s.tokens.iter()) {
            for value in column.values(token) {
                *counts.entry(normalize(value, cased)).or_default() += 1;
            }
        }

        let mut entries: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= min_occur_count.max(1))
            .collect();
        entries.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));

        let mut id_to_str: Vec<String> = [PAD, ROOT, UNK].iter().map(|s| s.to_string()).collect();
        id_to_str.extend(
            entries
                .into_iter()
                .map(|(value, _)| value)
                .filter(|value| value != PAD && value != ROOT && value != UNK),
        );
        let str_to_id = id_to_str
            .iter()
            .enumerate()
            .map(|(idx, value)| (value.clone(), idx))
            .collect();

        Self {
            name: name.to_string(),
            cased,
            id_to_str,
            str_to_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    pub fn index(&self, value: &str) -> usize {
        self.str_to_id
            .get(&normalize(value, self.cased))
            .copied()
            .unwrap_or(UNK_ID)
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.id_to_str.get(id).map(String::as_str)
    }
}

fn normalize(value: &str, cased: bool) -> String {
    if cased {
        value.to_string()
    } else {
        value.to_lowercase()
    }
}

/// The three vocabularies a network is built over.
#[derive(Debug, Clone)]
pub struct Vocabs {
    pub words: Vocab,
    pub tags: Vocab,
    pub rels: Vocab,
}

impl Vocabs {
    pub fn from_training(sentences: &[Sentence], min_occur_count: usize, cased: bool) -> Self {
        Self {
            words: Vocab::from_sentences(
                "Words",
                sentences,
                VocabColumn::Forms,
                min_occur_count,
                cased,
            ),
            tags: Vocab::from_sentences("Tags", sentences, VocabColumn::Tags, 1, true),
            rels: Vocab::from_sentences("Rels", sentences, VocabColumn::Rels, 1, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PAD_ID, ROOT_ID, UNK_ID, Vocab, VocabColumn, Vocabs};
    use crate::data::conll::parse_conll;
    use crate::data::conll::tests::TREEBANK;

    #[test]
    fn special_ids_come_first() {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocab = Vocab::from_sentences("Words", &sentences, VocabColumn::Forms, 1, false);
        assert_eq!(vocab.get(PAD_ID), Some("<PAD>"));
        assert_eq!(vocab.get(ROOT_ID), Some("<ROOT>"));
        assert_eq!(vocab.get(UNK_ID), Some("<UNK>"));
    }

    #[test]
    fn ids_follow_descending_counts() {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocab = Vocab::from_sentences("Words", &sentences, VocabColumn::Forms, 1, false);
        // "the" x3 and "." x3 tie; alphabetical order puts "." first
        assert_eq!(vocab.index("."), 3);
        assert_eq!(vocab.index("the"), 4);
        assert_eq!(vocab.index("The"), 4);
    }

    #[test]
    fn rare_words_map_to_unk() {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocab = Vocab::from_sentences("Words", &sentences, VocabColumn::Forms, 2, false);
        assert_eq!(vocab.index("barks"), UNK_ID);
        assert_ne!(vocab.index("dog"), UNK_ID);
        assert_eq!(vocab.index("zebra"), UNK_ID);
    }

    #[test]
    fn cased_vocab_keeps_capitals_apart() {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocab = Vocab::from_sentences("Words", &sentences, VocabColumn::Forms, 1, true);
        assert_ne!(vocab.index("The"), vocab.index("the"));
    }

    #[test]
    fn tag_vocab_covers_both_tag_columns() {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocabs = Vocabs::from_training(&sentences, 2, false);
        for tag in ["DET", "DT", "NOUN", "NNS", "VBP", "PUNCT", "."] {
            assert_ne!(vocabs.tags.index(tag), UNK_ID, "{tag} missing");
        }
        assert_eq!(vocabs.rels.get(vocabs.rels.index("obj")), Some("obj"));
    }
}
