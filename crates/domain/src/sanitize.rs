//! 明文消息净化。
//!
//! 只转义 `<`、`>`、`"` 三个字符。`&` 保持原样，这样对已净化文本再次净化
//! 不会产生变化（幂等），转发路径上重复处理是安全的。

/// 转义 HTML 敏感字符。标记为加密的密文不经过此函数。
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// 按字符数截断，保证不切在 UTF-8 码点中间。
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_significant_characters() {
        let out = sanitize_text(r#"<script>alert("hi")</script>"#);
        assert!(!out.contains('<'));
        assert!(!out.contains('>'));
        assert!(!out.contains('"'));
        assert_eq!(
            out,
            "&lt;script&gt;alert(&quot;hi&quot;)&lt;/script&gt;"
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            r#"<a href="x">link</a>"#,
            "plain text",
            "fish & chips",
            "已经 &lt;转义&gt; 过的",
        ];
        for input in inputs {
            let once = sanitize_text(input);
            assert_eq!(sanitize_text(&once), once);
        }
    }

    #[test]
    fn leaves_ampersand_untouched() {
        assert_eq!(sanitize_text("a & b"), "a & b");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("短", 5), "短");
        assert_eq!(truncate_chars("", 5), "");
    }
}
