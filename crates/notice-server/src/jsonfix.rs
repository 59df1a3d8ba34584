//! JSON 修复
//!
//! 有些发送方把裸换行、回车、制表符直接塞进 JSON 字符串字面量。
//! 这里做一次纯词法扫描, 只在字符串内部把这三种字节替换成对应
//! 的转义序列, 字符串之外原样保留。不验证结果是否合法 JSON,
//! 那是解析器的事。

/// 修复字符串字面量内的裸控制字符
pub fn repair(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for &b in input {
        let was_escaped = escaped;
        escaped = b == b'\\' && !was_escaped;
        if b == b'"' && !was_escaped {
            in_string = !in_string;
        }
        if in_string && !was_escaped {
            match b {
                b'\n' => {
                    out.extend_from_slice(b"\\n");
                    continue;
                }
                b'\r' => {
                    out.extend_from_slice(b"\\r");
                    continue;
                }
                b'\t' => {
                    out.extend_from_slice(b"\\t");
                    continue;
                }
                _ => {}
            }
        }
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repair_str(input: &str) -> String {
        String::from_utf8(repair(input.as_bytes())).unwrap()
    }

    #[test]
    fn test_identity_on_clean_json() {
        let cases = [
            r#"{"content":"hi"}"#,
            r#"{"content":"a\nb"}"#,
            r#"{"a":1,"b":[true,null]}"#,
            r#"{"path":"C:\\temp\\x"}"#,
        ];
        for case in cases {
            assert_eq!(repair_str(case), case);
        }
    }

    #[test]
    fn test_bare_newline_in_string_escaped() {
        assert_eq!(
            repair_str("{\"content\":\"line1\nline2\"}"),
            r#"{"content":"line1\nline2"}"#
        );
    }

    #[test]
    fn test_bare_tab_and_cr() {
        assert_eq!(
            repair_str("{\"content\":\"a\tb\rc\"}"),
            r#"{"content":"a\tb\rc"}"#
        );
    }

    #[test]
    fn test_whitespace_outside_strings_untouched() {
        let pretty = "{\n\t\"content\": \"hi\"\n}";
        assert_eq!(repair_str(pretty), pretty);
    }

    #[test]
    fn test_escaped_quote_does_not_close_string() {
        assert_eq!(
            repair_str("{\"content\":\"say \\\"hi\"\n}"),
            "{\"content\":\"say \\\"hi\"\n}"
        );
    }

    #[test]
    fn test_roundtrip_preserves_multiline_content() {
        let body = "{\"title\":\"t\",\"content\":\"line1\nline2\"}";
        let repaired = repair(body.as_bytes());
        let value: serde_json::Value = serde_json::from_slice(&repaired).unwrap();
        assert_eq!(value["content"], "line1\nline2");
        assert_eq!(value["title"], "t");
    }
}
