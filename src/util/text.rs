/// テキスト処理ユーティリティ。
use unicode_segmentation::UnicodeSegmentation;

/// 書記素クラスタ単位で先頭 `max_graphemes` 文字に切り詰める。
///
/// 切り詰めが発生した場合は末尾に `…` を付与する。
#[must_use]
pub fn truncate_graphemes(text: &str, max_graphemes: usize) -> String {
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(max_graphemes).collect();
    if graphemes.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

/// 連続する空白・改行を単一の空白にまとめる。
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_graphemes("hello", 10), "hello");
    }

    #[test]
    fn truncate_respects_grapheme_boundaries() {
        let text = "日本語のテキストです";
        assert_eq!(truncate_graphemes(text, 3), "日本語…");
    }

    #[test]
    fn collapse_whitespace_joins_lines() {
        assert_eq!(collapse_whitespace("a\n\n b\t c "), "a b c");
    }
}
