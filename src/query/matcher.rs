use std::sync::Arc;

use wildmatch::WildMatch;

/// Channel 过滤器：匹配 12 字节定长 channel 串（尾部空格填充）
pub trait ChannelMatcher: Send + Sync {
    fn matches(&self, channel: &str) -> bool;
}

/// 精确匹配（忽略尾部填充空格）
pub struct ExactMatcher {
    pattern: String,
}

impl ExactMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.trim_end().to_string(),
        }
    }
}

impl ChannelMatcher for ExactMatcher {
    fn matches(&self, channel: &str) -> bool {
        channel.trim_end() == self.pattern
    }
}

/// 通配符匹配 (`*` / `?`)，同时尝试原串与去尾空格串
pub struct GlobMatcher {
    wild: WildMatch,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            wild: WildMatch::new(pattern),
        }
    }
}

impl ChannelMatcher for GlobMatcher {
    fn matches(&self, channel: &str) -> bool {
        self.wild.matches(channel) || self.wild.matches(channel.trim_end())
    }
}

/// 按模式自动选择匹配器
pub fn create_matcher(pattern: &str) -> Arc<dyn ChannelMatcher> {
    if pattern.contains('*') || pattern.contains('?') {
        Arc::new(GlobMatcher::new(pattern))
    } else {
        Arc::new(ExactMatcher::new(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_ignores_padding() {
        let m = create_matcher("XXCCC  HHZ");
        assert!(m.matches("XXCCC  HHZ  "));
        assert!(!m.matches("XXCCC  HHZ00"));
    }

    #[test]
    fn glob_patterns() {
        let m = create_matcher("US*BHZ*");
        assert!(m.matches("USAAA  BHZ00"));
        assert!(m.matches("USBBB  BHZ  "));
        assert!(!m.matches("XXCCC  BHZ00"));

        let m = create_matcher("USAA?  BHZ00");
        assert!(m.matches("USAAA  BHZ00"));
        assert!(!m.matches("USAAAA BHZ00"));
    }
}
