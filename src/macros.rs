//! `#define` 行到编译器 `-D` 表达式的转换

use std::sync::LazyLock;

use regex::Regex;

static OBJECT_MACRO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\s*define\s+(\w+)\s+(.*?)\s*$").expect("object macro pattern")
});

static FUNCTION_MACRO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\s*define\s+(\w+\([^)]*\))(?:\s*(.*?))?\s*$").expect("function macro pattern")
});

static BARE_MACRO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#\s*define\s+(\w+)\s*$").expect("bare macro pattern"));

/// 宏定义处理器
#[derive(Debug, Default, Clone, Copy)]
pub struct MacroHandler;

impl MacroHandler {
    pub fn new() -> Self {
        MacroHandler
    }

    /// `#define NAME VALUE` → `NAME=VALUE`
    /// `#define NAME(args) VALUE` → `NAME(args)=`（函数宏无法用 -D 携带宏体，定义为空）
    /// `#define NAME` → `NAME`
    /// 其它行返回 None
    pub fn to_expression(&self, line: &str) -> Option<String> {
        if let Some(caps) = FUNCTION_MACRO.captures(line) {
            return Some(format!("{}=", &caps[1]));
        }
        if let Some(caps) = OBJECT_MACRO.captures(line) {
            return Some(format!("{}={}", &caps[1], &caps[2]));
        }
        BARE_MACRO.captures(line).map(|caps| caps[1].to_string())
    }
}

/// 从头文件文本中提取宏：先拼接 `\` 续行、去掉注释，再逐行转换
pub fn extract_defines(content: &str) -> Vec<String> {
    let handler = MacroHandler::new();
    let mut in_block_comment = false;
    let mut pending = String::new();
    let mut result = Vec::new();

    for raw in content.lines() {
        let line = strip_comments(raw, &mut in_block_comment);
        let trimmed = line.trim_end();

        if let Some(head) = trimmed.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }

        pending.push_str(trimmed);
        let logical = std::mem::take(&mut pending);
        if let Some(expr) = handler.to_expression(&logical) {
            result.push(expr);
        }
    }

    if let Some(expr) = handler.to_expression(&pending) {
        result.push(expr);
    }
    result
}

/// 去掉行内 `//` 与 `/* */` 注释，保留字符串字面量中的内容
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if *in_block {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                *in_block = false;
                out.push(' ');
            }
            continue;
        }

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => break,
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                *in_block = true;
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_like_macro() {
        let handler = MacroHandler::new();
        assert_eq!(
            handler.to_expression("#define __ARM_ARCH 7").as_deref(),
            Some("__ARM_ARCH=7")
        );
        assert_eq!(
            handler.to_expression("#define __VERSION__ \"Clang 6.19\"").as_deref(),
            Some("__VERSION__=\"Clang 6.19\"")
        );
    }

    #[test]
    fn test_function_like_macro_drops_body() {
        let handler = MacroHandler::new();
        assert_eq!(
            handler.to_expression("#define __ALIGN(x) __attribute__((aligned(x)))").as_deref(),
            Some("__ALIGN(x)=")
        );
        assert_eq!(
            handler.to_expression("#define MAX(a,b) ((a)>(b)?(a):(b))").as_deref(),
            Some("MAX(a,b)=")
        );
    }

    #[test]
    fn test_non_define_lines() {
        let handler = MacroHandler::new();
        assert_eq!(handler.to_expression("#include <stdint.h>"), None);
        assert_eq!(handler.to_expression("int x = 1;"), None);
        assert_eq!(handler.to_expression(""), None);
        assert_eq!(handler.to_expression("#undef FOO"), None);
    }

    #[test]
    fn test_bare_define() {
        let handler = MacroHandler::new();
        assert_eq!(
            handler.to_expression("#define RTE_Compiler_EventRecorder").as_deref(),
            Some("RTE_Compiler_EventRecorder")
        );
    }

    #[test]
    fn test_extract_defines_with_continuation_and_comments() {
        let header = r#"
/* RTE_Components.h
 * #define NOT_A_MACRO 1
 */
#define CMSIS_device_header "stm32f4xx.h"   // device header
#define RTE_DEVICE_STARTUP_STM32F4XX
#define OS_STACK_SIZE \
        512
#define URL "http://example.com"
int unused;
"#;
        let defines = extract_defines(header);
        assert_eq!(
            defines,
            vec![
                "CMSIS_device_header=\"stm32f4xx.h\"",
                "RTE_DEVICE_STARTUP_STM32F4XX",
                "OS_STACK_SIZE=512",
                "URL=\"http://example.com\"",
            ]
        );
    }
}
