use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static SOURCE_MAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^//[#@]\s*sourceMappingURL=.*$").unwrap());

// Dynamic imports resolve relative to the real origin inside the engine, so
// the argument is routed through the client-side hook first. The leading
// capture keeps member accesses like `loader.import(...)` untouched.
static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^.\w$])import\s*\(").unwrap());

/// Rewrite a JavaScript body: drop source-map annotations and hook dynamic
/// `import(...)` through the interceptor's URL rewriter.
pub fn rewrite_js(source: &str) -> String {
    let stripped = SOURCE_MAP_RE.replace_all(source, "");
    DYNAMIC_IMPORT_RE
        .replace_all(&stripped, |caps: &Captures| {
            format!("{}import(self.__d_rw(", &caps[1])
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_dynamic_import() {
        assert_eq!(
            rewrite_js("const m = await import('./mod.js');"),
            "const m = await import(self.__d_rw('./mod.js');"
        );
    }

    #[test]
    fn leaves_member_import_calls_alone() {
        let src = "loader.import('./mod.js');";
        assert_eq!(rewrite_js(src), src);
    }

    #[test]
    fn leaves_static_imports_alone() {
        let src = "import { a } from './mod.js';";
        assert_eq!(rewrite_js(src), src);
    }

    #[test]
    fn hooks_import_at_line_start() {
        assert_eq!(
            rewrite_js("import(url)"),
            "import(self.__d_rw(url)"
        );
    }

    #[test]
    fn strips_source_map_lines() {
        let src = "var x = 1;\n//# sourceMappingURL=app.js.map";
        let out = rewrite_js(src);
        assert!(!out.contains("sourceMappingURL"));
        assert!(out.contains("var x = 1;"));
    }
}
