//! Offline Japanese product-name cleanup for storefront uploads.
//!
//! Brand names translate terribly through machine translation, so a fixed
//! pattern table handles the catalog vocabulary; anything left untranslated
//! keeps the original text with a `(JP)` marker for manual follow-up.

use regex::Regex;
use tracing::debug;

const NAME_PATTERNS: [(&str, &str); 10] = [
    ("ジェルミーペタリー", "Gel Me Petaly"),
    ("ジェルミー", "Gel Me"),
    ("オーロラフレンチ", "Aurora French"),
    ("ココマンゴー", "Coco Mango"),
    ("アンバーフィグ", "Amber Fig"),
    ("ハニーディライト", "Honey Delight"),
    ("メルティングチーク", "Melting Cheek"),
    ("サンタモニカ", "Santa Monica"),
    ("クラウドムース", "Cloud Mousse"),
    ("プルメリア", "Plumeria"),
];

pub fn contains_japanese(text: &str) -> bool {
    // Hiragana, katakana, and the CJK unified block.
    text.chars().any(|c| {
        matches!(c,
            '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}' | '\u{4E00}'..='\u{9FFF}')
    })
}

fn translate_name(text: &str) -> String {
    let discount = Regex::new(r"【(\d+)％OFF】").expect("static pattern");
    let mut translated = discount.replace_all(text, "[$1% OFF] ").into_owned();

    for (japanese, english) in NAME_PATTERNS {
        translated = translated.replace(japanese, english);
    }

    if translated == text {
        debug!(name = text, "no pattern match for product name");
        return format!("{text} (JP)");
    }
    translated.trim().to_string()
}

/// Clean a scraped product name for the English-facing storefront.
pub fn clean_product_name(name: &str) -> String {
    let cleaned = if contains_japanese(name) {
        translate_name(name)
    } else {
        name.to_string()
    };
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
