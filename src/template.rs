//! Shader templating.
//!
//! The four kernels are embedded at build time and parameterised over the
//! workgroup geometry and the record layout. Substitution happens on the
//! host before device compilation; compiled programs are therefore only
//! valid for the exact configuration they were rendered with, and changing
//! either the workgroup size or the record layout means recompiling all
//! four.

const COMMON: &str = include_str!("../shaders/common.glsl");
const RADIX_SCAN: &str = include_str!("../shaders/radix_scan.glsl");
const PREFIX_SUM: &str = include_str!("../shaders/prefix_sum.glsl");
const ADD_BLOCK: &str = include_str!("../shaders/add_block.glsl");
const SCATTER: &str = include_str!("../shaders/scatter.glsl");

/// Constants substituted into the embedded GLSL sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShaderConfig {
    /// Records covered by one workgroup (`W`). Power of two, >= 2.
    pub workgroup_items: u32,
    /// 32-bit words per record.
    pub record_words: u32,
    /// Word index of the key within a record.
    pub key_word: u32,
}

impl ShaderConfig {
    pub fn render_radix_scan(&self) -> String {
        self.render(RADIX_SCAN)
    }

    pub fn render_prefix_sum(&self) -> String {
        self.render(PREFIX_SUM)
    }

    pub fn render_add_block(&self) -> String {
        self.render(ADD_BLOCK)
    }

    pub fn render_scatter(&self) -> String {
        self.render(SCATTER)
    }

    /// Prepend the common preamble and substitute every placeholder. Each
    /// kernel file uses two lanes per workgroup item, hence the halved
    /// local size.
    fn render(&self, body: &str) -> String {
        let mut source = String::with_capacity(COMMON.len() + body.len() + 1);
        source.push_str(COMMON);
        source.push('\n');
        source.push_str(body);
        source
            .replace("{{WORKGROUP_ITEMS}}", &self.workgroup_items.to_string())
            .replace("{{WORKGROUP_SIZE}}", &(self.workgroup_items / 2).to_string())
            .replace("{{RECORD_WORDS}}", &self.record_words.to_string())
            .replace("{{KEY_WORD}}", &self.key_word.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ShaderConfig {
        ShaderConfig {
            workgroup_items: 256,
            record_words: 3,
            key_word: 1,
        }
    }

    #[test]
    fn substitutes_every_placeholder() {
        for source in [
            config().render_radix_scan(),
            config().render_prefix_sum(),
            config().render_add_block(),
            config().render_scatter(),
        ] {
            assert!(!source.contains("{{"), "unsubstituted placeholder in:\n{source}");
            assert!(source.starts_with("#version 430"));
        }
    }

    #[test]
    fn workgroup_size_is_half_the_items() {
        let source = config().render_radix_scan();
        assert!(source.contains("#define WORKGROUP_ITEMS 256u"));
        assert!(source.contains("#define WORKGROUP_SIZE 128u"));
        assert!(source.contains("local_size_x = 128,"));
    }

    #[test]
    fn record_layout_is_substituted() {
        let source = config().render_scatter();
        assert!(source.contains("#define RECORD_WORDS 3u"));
        assert!(source.contains("#define KEY_WORD 1u"));
    }

    #[test]
    fn minimum_workgroup_renders_one_lane() {
        let source = ShaderConfig {
            workgroup_items: 2,
            record_words: 1,
            key_word: 0,
        }
        .render_prefix_sum();
        assert!(source.contains("local_size_x = 1,"));
    }
}
