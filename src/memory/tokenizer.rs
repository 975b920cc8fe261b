//! 分词模块
//!
//! 中英文混合分词，用于归档摘要的关键词提取与归档检索。
//! 含 CJK 字符时使用 jieba-rs 搜索模式分词，否则按空白与标点切分。

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOP_WORDS: &[&str] = &[
    // English
    "the", "and", "for", "are", "but", "not", "you", "your", "all", "any", "can", "had", "her",
    "was", "one", "our", "out", "has", "have", "his", "how", "its", "may", "who", "did", "get",
    "got", "him", "she", "too", "use", "that", "this", "with", "from", "they", "them", "then",
    "than", "what", "when", "will", "would", "could", "should", "there", "their", "about",
    "just", "like", "some", "into", "also", "very", "been", "were", "which", "while", "here",
    "really", "today", "feel", "feeling", "think", "know", "want", "me", "my", "is", "it",
    "to", "of", "in", "on", "at", "an", "be", "do", "so", "we", "am", "as", "or", "if", "no",
    "up", "by", "i'm", "it's", "don't",
    // 中文
    "我们", "你们", "他们", "自己", "什么", "怎么", "这个", "那个", "这样", "那样", "因为",
    "所以", "但是", "然后", "还是", "就是", "已经", "可以", "没有", "一个", "一些", "今天",
    "觉得", "感觉", "真的", "非常", "时候", "现在", "一下", "知道", "的", "了", "是", "在",
    "我", "你", "他", "她", "它", "和", "也", "就", "都", "很", "吗", "吧", "呢", "啊", "有",
    "不", "人", "这", "那", "要", "会", "说", "去", "好",
];

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn clean_token(raw: &str) -> Option<String> {
    let token: String = raw
        .trim_matches(|c: char| !(c.is_alphanumeric() || c == '\'' || is_cjk(c)))
        .to_lowercase();
    if token.is_empty() {
        return None;
    }
    let first = token.chars().next().unwrap_or(' ');
    if token.chars().count() > 1 || is_cjk(first) {
        Some(token)
    } else {
        None
    }
}

/// 智能分词：根据文本内容自动选择分词策略
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        // 搜索引擎模式，更细粒度
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .filter_map(clean_token)
            .collect()
    } else {
        text.split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?' | ';' | ':'))
            .filter_map(clean_token)
            .collect()
    }
}

/// 分词并返回词集合
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}

/// 是否为停用词（或纯数字）
pub fn is_stop_word(token: &str) -> bool {
    stop_words().contains(token) || token.chars().all(|c| c.is_ascii_digit())
}

/// 按词频取前 k 个关键词（去停用词；同频按首次出现顺序）
pub fn top_keywords<'a>(texts: impl IntoIterator<Item = &'a str>, k: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for text in texts {
        for token in tokenize(text) {
            if is_stop_word(&token) {
                continue;
            }
            let entry = counts.entry(token).or_insert_with(|| {
                order += 1;
                (0, order)
            });
            entry.0 += 1;
        }
    }
    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(k).map(|(token, _, _)| token).collect()
}
