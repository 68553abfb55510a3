//! Query tokenization for the lexical branch
//!
//! Mixed CJK/English handling: when the query contains CJK characters the
//! CJK runs are segmented into overlapping bigrams (single characters are
//! below the minimum token length) and filtered against a Chinese stopword
//! set; otherwise the query goes through lowercasing, English stopword
//! removal and stemming via the tantivy analyzer pipeline.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use tantivy::tokenizer::{
    Language, LowerCaser, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer,
};
use unicode_segmentation::UnicodeSegmentation;

const MIN_TOKEN_LENGTH: usize = 2;

static CHINESE_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "上",
        "也", "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这",
        "那", "他", "她", "它", "我们", "你们", "他们", "什么", "这个", "那个", "吗", "吧", "呢",
        "啊", "把", "被", "对", "与", "及", "或", "等", "并", "而", "给",
    ]
    .into_iter()
    .collect()
});

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
    )
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// Segment a query containing CJK text: CJK runs become bigrams, other
/// words pass whole; everything is stopword-filtered at minimum length 2.
fn tokenize_cjk(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in query.unicode_words() {
        if contains_cjk(word) {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() == 1 {
                continue;
            }
            for pair in chars.windows(2) {
                let token: String = pair.iter().collect();
                if !CHINESE_STOPWORDS.contains(token.as_str()) {
                    tokens.push(token);
                }
            }
        } else {
            let lowered = word.to_lowercase();
            if lowered.chars().count() >= MIN_TOKEN_LENGTH
                && !CHINESE_STOPWORDS.contains(lowered.as_str())
            {
                tokens.push(lowered);
            }
        }
    }
    tokens
}

/// Lowercase, drop English stopwords, stem.
fn tokenize_english(query: &str) -> Vec<String> {
    let mut analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::new(Language::English).expect("bundled English stopword list"))
        .filter(Stemmer::new(Language::English))
        .build();

    let mut tokens = Vec::new();
    let mut stream = analyzer.token_stream(query);
    while stream.advance() {
        let text = stream.token().text.clone();
        if text.chars().count() >= MIN_TOKEN_LENGTH {
            tokens.push(text);
        }
    }
    tokens
}

/// Tokenize one query for the lexical store.
pub fn tokenize_query(query: &str) -> Vec<String> {
    if query.trim().is_empty() {
        return Vec::new();
    }
    if contains_cjk(query) {
        tokenize_cjk(query)
    } else {
        tokenize_english(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_queries_are_stemmed_and_stopword_filtered() {
        let tokens = tokenize_query("What are the users preferences for deployments?");
        assert!(!tokens.iter().any(|t| t == "the" || t == "what" || t == "are"));
        // Stemming folds related forms.
        assert!(tokens.iter().any(|t| t.starts_with("deploy")));
        assert!(tokens.iter().any(|t| t.starts_with("prefer")));
    }

    #[test]
    fn cjk_queries_become_bigrams() {
        let tokens = tokenize_query("产品发布计划");
        assert!(tokens.contains(&"产品".to_string()));
        assert!(tokens.contains(&"发布".to_string()));
        assert!(tokens.contains(&"计划".to_string()));
        assert!(tokens.iter().all(|t| t.chars().count() >= 2));
    }

    #[test]
    fn mixed_queries_keep_latin_words_whole() {
        let tokens = tokenize_query("AI产品群 roadmap");
        assert!(tokens.contains(&"ai".to_string()));
        assert!(tokens.contains(&"roadmap".to_string()));
        assert!(tokens.contains(&"产品".to_string()));
    }

    #[test]
    fn chinese_stopwords_are_removed() {
        let tokens = tokenize_query("我们的计划");
        assert!(!tokens.contains(&"我们".to_string()));
        assert!(tokens.contains(&"计划".to_string()));
    }

    #[test]
    fn empty_query_yields_no_tokens() {
        assert!(tokenize_query("   ").is_empty());
    }
}
