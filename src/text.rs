use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Removes markup from model-supplied text and collapses whitespace.
pub fn strip_markup(input: &str) -> String {
    let text = SCRIPT_RE.replace_all(input, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = TAG_RE.replace_all(&text, " ");
    let text = html_escape::decode_html_entities(&text).to_string();
    // Decoding can surface new tags (e.g. `&lt;b&gt;`)
    let text = TAG_RE.replace_all(&text, " ");
    SPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// Truncates on a character boundary, appending an ellipsis when cut.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn sanitize(input: &str, max_chars: usize) -> String {
    truncate_chars(&strip_markup(input), max_chars)
}
