//! Incremental outline-document engine.
//! Scans plain text for outline constructs (headings, lists, blocks, links, dates, inline marks),
//! keeps the resulting tokens in position-sorted caches and repairs them locally after each edit.

pub mod core {
    use crate::date::DateAndTime;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::ops::Range;

    /* ------------------------------ Ranges ------------------------------ */

    /// Half-open byte range `[location, location + length)` into a text buffer.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    )]
    pub struct TextRange {
        pub location: usize,
        pub length: usize,
    }

    impl TextRange {
        pub const fn new(location: usize, length: usize) -> Self {
            Self { location, length }
        }

        /// Build a range from its bounds. Panics when `end < start`.
        pub fn from_bounds(start: usize, end: usize) -> Self {
            assert!(start <= end, "range bounds out of order: {start}..{end}");
            Self::new(start, end - start)
        }

        pub const fn upper_bound(&self) -> usize {
            self.location + self.length
        }

        pub const fn is_empty(&self) -> bool {
            self.length == 0
        }

        pub const fn as_range(&self) -> Range<usize> {
            self.location..self.upper_bound()
        }

        pub const fn contains(&self, location: usize) -> bool {
            location >= self.location && location < self.upper_bound()
        }

        /// Overlap of the two ranges, `None` unless it has positive length.
        pub fn intersection(&self, other: &TextRange) -> Option<TextRange> {
            let start = self.location.max(other.location);
            let end = self.upper_bound().min(other.upper_bound());
            (start < end).then(|| TextRange::from_bounds(start, end))
        }

        pub fn intersects(&self, other: &TextRange) -> bool {
            self.intersection(other).is_some()
        }

        /// Overlapping or adjacent. Empty ranges touch anything at their location.
        pub fn touches(&self, other: &TextRange) -> bool {
            self.location <= other.upper_bound() && other.location <= self.upper_bound()
        }

        pub fn union(&self, other: &TextRange) -> TextRange {
            TextRange::from_bounds(
                self.location.min(other.location),
                self.upper_bound().max(other.upper_bound()),
            )
        }

        /// First `n` bytes of the range.
        pub fn head(&self, n: usize) -> TextRange {
            TextRange::new(self.location, n.min(self.length))
        }

        /// Last `n` bytes of the range.
        pub fn tail(&self, n: usize) -> TextRange {
            let n = n.min(self.length);
            TextRange::new(self.upper_bound() - n, n)
        }

        /// Move the range by `delta` bytes. Panics when the location would go negative.
        pub fn offset(&self, delta: isize) -> TextRange {
            match self.location.checked_add_signed(delta) {
                Some(location) => TextRange::new(location, self.length),
                None => panic!("offset {delta} moves {self:?} before the buffer start"),
            }
        }
    }

    impl From<Range<usize>> for TextRange {
        fn from(r: Range<usize>) -> Self {
            TextRange::from_bounds(r.start, r.end)
        }
    }

    /* ------------------------------ Tokens ------------------------------ */

    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    )]
    pub struct TokenId(pub u64);

    /// Named sub-range of a token.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    )]
    #[serde(rename_all = "snake_case")]
    pub enum Role {
        Level,
        Identifier,
        Planning,
        Priority,
        Tags,
        Status,
        Prefix,
        Index,
        Url,
        Scheme,
        Title,
        AttachmentType,
        AttachmentValue,
        Language,
        DrawerName,
        Content,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum BlockKind {
        SourceCode,
        Quote,
        Drawer,
    }

    impl BlockKind {
        pub const ALL: [BlockKind; 3] = [BlockKind::SourceCode, BlockKind::Quote, BlockKind::Drawer];

        pub(crate) const fn index(self) -> usize {
            match self {
                BlockKind::SourceCode => 0,
                BlockKind::Quote => 1,
                BlockKind::Drawer => 2,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MarkKind {
        Bold,
        Italic,
        Underscore,
        Strikethrough,
        Verbatim,
        Highlight,
    }

    impl MarkKind {
        pub const ALL: [MarkKind; 6] = [
            MarkKind::Bold,
            MarkKind::Italic,
            MarkKind::Underscore,
            MarkKind::Strikethrough,
            MarkKind::Verbatim,
            MarkKind::Highlight,
        ];

        /// Delimiter character on both sides of the mark.
        pub const fn delimiter(self) -> char {
            match self {
                MarkKind::Bold => '*',
                MarkKind::Italic => '/',
                MarkKind::Underscore => '_',
                MarkKind::Strikethrough => '+',
                MarkKind::Verbatim => '=',
                MarkKind::Highlight => '~',
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadingData {
        /// Number of leading `*`.
        pub level: usize,
        /// Taken from an inline `{id:...}` marker, otherwise a fresh UUID.
        pub identifier: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum TokenKind {
        Heading(HeadingData),
        Checkbox,
        OrderedListItem,
        UnorderedListItem,
        Separator,
        Attachment,
        Link,
        TextMark { mark: MarkKind },
        DateAndTime { value: Option<DateAndTime> },
        BlockBegin { block: BlockKind },
        BlockEnd { block: BlockKind },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Token {
        pub id: TokenId,
        #[serde(flatten)]
        pub kind: TokenKind,
        range: TextRange,
        roles: BTreeMap<Role, TextRange>,
    }

    impl Token {
        pub fn new(
            id: TokenId,
            kind: TokenKind,
            range: TextRange,
            roles: BTreeMap<Role, TextRange>,
        ) -> Self {
            Self {
                id,
                kind,
                range,
                roles,
            }
        }

        /// The token's own span. Paired block begins report only their marker line here.
        pub fn range(&self) -> TextRange {
            self.range
        }

        pub fn role(&self, role: Role) -> Option<TextRange> {
            self.roles.get(&role).copied()
        }

        pub fn roles(&self) -> &BTreeMap<Role, TextRange> {
            &self.roles
        }

        /// Cache ordering key.
        pub fn sort_key(&self) -> (usize, usize) {
            (self.range.location, self.range.length)
        }

        pub(crate) fn shift(&mut self, delta: isize) {
            self.range = self.range.offset(delta);
            for r in self.roles.values_mut() {
                *r = r.offset(delta);
            }
        }

        pub fn name(&self) -> &'static str {
            match &self.kind {
                TokenKind::Heading(_) => "heading",
                TokenKind::Checkbox => "checkbox",
                TokenKind::OrderedListItem => "ordered-list",
                TokenKind::UnorderedListItem => "unordered-list",
                TokenKind::Separator => "separator",
                TokenKind::Attachment => "attachment",
                TokenKind::Link => "link",
                TokenKind::TextMark { mark } => match mark {
                    MarkKind::Bold => "bold",
                    MarkKind::Italic => "italic",
                    MarkKind::Underscore => "underscore",
                    MarkKind::Strikethrough => "strikethrough",
                    MarkKind::Verbatim => "verbatim",
                    MarkKind::Highlight => "highlight",
                },
                TokenKind::DateAndTime { .. } => "date-and-time",
                TokenKind::BlockBegin { block } => match block {
                    BlockKind::SourceCode => "code-block-begin",
                    BlockKind::Quote => "quote-block-begin",
                    BlockKind::Drawer => "drawer-begin",
                },
                TokenKind::BlockEnd { block } => match block {
                    BlockKind::SourceCode => "code-block-end",
                    BlockKind::Quote => "quote-block-end",
                    BlockKind::Drawer => "drawer-end",
                },
            }
        }

        pub fn heading(&self) -> Option<&HeadingData> {
            match &self.kind {
                TokenKind::Heading(data) => Some(data),
                _ => None,
            }
        }

        pub fn is_heading(&self) -> bool {
            self.heading().is_some()
        }

        pub fn level(&self) -> Option<usize> {
            self.heading().map(|h| h.level)
        }

        pub fn is_link(&self) -> bool {
            matches!(self.kind, TokenKind::Link)
        }

        pub fn block_kind(&self) -> Option<BlockKind> {
            match self.kind {
                TokenKind::BlockBegin { block } | TokenKind::BlockEnd { block } => Some(block),
                _ => None,
            }
        }

        pub fn is_block_begin(&self) -> bool {
            matches!(self.kind, TokenKind::BlockBegin { .. })
        }

        pub fn is_block_end(&self) -> bool {
            matches!(self.kind, TokenKind::BlockEnd { .. })
        }

        pub fn date_and_time(&self) -> Option<&DateAndTime> {
            match &self.kind {
                TokenKind::DateAndTime { value } => value.as_ref(),
                _ => None,
            }
        }

        /// Bracketed link pointing at another document (`x3:` scheme).
        pub fn is_document_link(&self, text: &str) -> bool {
            self.is_link()
                && self
                    .role(Role::Scheme)
                    .and_then(|r| text.get(r.as_range()))
                    .is_some_and(|scheme| scheme == crate::grammar::values::DOCUMENT_LINK_SCHEME)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum OutlineError {
        #[error("range {start}..{end} is outside the buffer (length {len})")]
        RangeOutOfBounds { start: usize, end: usize, len: usize },
        #[error("offset {0} does not fall on a character boundary")]
        NotCharBoundary(usize),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn intersection_requires_positive_overlap() {
            let a = TextRange::new(0, 5);
            assert_eq!(a.intersection(&TextRange::new(3, 4)), Some(TextRange::new(3, 2)));
            assert!(!a.intersects(&TextRange::new(5, 2)));
            assert!(!a.intersects(&TextRange::new(2, 0)));
        }

        #[test]
        fn touches_includes_adjacency_and_empty_ranges() {
            let a = TextRange::new(4, 3);
            assert!(a.touches(&TextRange::new(7, 2)));
            assert!(a.touches(&TextRange::new(0, 4)));
            assert!(a.touches(&TextRange::new(5, 0)));
            assert!(!a.touches(&TextRange::new(8, 1)));
        }

        #[test]
        fn head_tail_and_union() {
            let r = TextRange::new(10, 6);
            assert_eq!(r.head(2), TextRange::new(10, 2));
            assert_eq!(r.tail(2), TextRange::new(14, 2));
            assert_eq!(r.tail(9), r);
            assert_eq!(r.union(&TextRange::new(2, 3)), TextRange::new(2, 14));
            assert!(r.contains(10) && r.contains(15) && !r.contains(16));
        }

        #[test]
        fn offset_moves_token_and_roles() {
            let mut roles = BTreeMap::new();
            roles.insert(Role::Level, TextRange::new(4, 1));
            let mut token = Token::new(
                TokenId(1),
                TokenKind::Checkbox,
                TextRange::new(4, 6),
                roles,
            );
            token.shift(-4);
            assert_eq!(token.range(), TextRange::new(0, 6));
            assert_eq!(token.role(Role::Level), Some(TextRange::new(0, 1)));
        }

        #[test]
        #[should_panic]
        fn offset_before_start_panics() {
            TextRange::new(1, 1).offset(-2);
        }
    }
}

pub mod grammar {
    //! Construct patterns and the bitmask selecting which constructs a scan looks for.
    //!
    //! Patterns are compiled once on first use. A pattern that fails to compile is a
    //! programming error and panics at that point.

    use once_cell::sync::Lazy;
    use regex::Regex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
    use std::fmt;
    use std::ops::{BitOr, BitOrAssign};

    /* --------------------------- Parsee bitmask --------------------------- */

    /// Set of constructs a parse pass should look for.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParseeTypes(u32);

    impl ParseeTypes {
        pub const EMPTY: Self = Self(0);
        pub const HEADING: Self = Self(1 << 0);
        pub const CHECKBOX: Self = Self(1 << 1);
        pub const ORDERED_LIST: Self = Self(1 << 2);
        pub const UNORDERED_LIST: Self = Self(1 << 3);
        pub const SEPARATOR: Self = Self(1 << 4);
        pub const ATTACHMENT: Self = Self(1 << 5);
        pub const LINK: Self = Self(1 << 6);
        pub const RAW_HTTP_LINK: Self = Self(1 << 7);
        pub const CODE_BLOCK_BEGIN: Self = Self(1 << 8);
        pub const CODE_BLOCK_END: Self = Self(1 << 9);
        pub const QUOTE_BLOCK_BEGIN: Self = Self(1 << 10);
        pub const QUOTE_BLOCK_END: Self = Self(1 << 11);
        pub const DRAWER: Self = Self(1 << 12);
        pub const DATE_AND_TIME: Self = Self(1 << 13);
        pub const TEXT_MARK: Self = Self(1 << 14);

        pub const ALL: Self = Self((1 << 15) - 1);
        /// Line constructs other than headings themselves.
        pub const ONLY_HEADING: Self = Self(
            Self::CHECKBOX.0
                | Self::ORDERED_LIST.0
                | Self::UNORDERED_LIST.0
                | Self::SEPARATOR.0
                | Self::ATTACHMENT.0
                | Self::LINK.0,
        );

        const NAMED: [(&'static str, ParseeTypes); 15] = [
            ("heading", Self::HEADING),
            ("checkbox", Self::CHECKBOX),
            ("ordered-list", Self::ORDERED_LIST),
            ("unordered-list", Self::UNORDERED_LIST),
            ("separator", Self::SEPARATOR),
            ("attachment", Self::ATTACHMENT),
            ("link", Self::LINK),
            ("raw-http-link", Self::RAW_HTTP_LINK),
            ("code-block-begin", Self::CODE_BLOCK_BEGIN),
            ("code-block-end", Self::CODE_BLOCK_END),
            ("quote-block-begin", Self::QUOTE_BLOCK_BEGIN),
            ("quote-block-end", Self::QUOTE_BLOCK_END),
            ("drawer", Self::DRAWER),
            ("date-and-time", Self::DATE_AND_TIME),
            ("text-mark", Self::TEXT_MARK),
        ];

        pub const fn bits(self) -> u32 {
            self.0
        }

        pub const fn contains(self, other: Self) -> bool {
            self.0 & other.0 == other.0
        }

        pub const fn is_empty(self) -> bool {
            self.0 == 0
        }

        pub fn insert(&mut self, other: Self) {
            self.0 |= other.0;
        }

        pub fn remove(&mut self, other: Self) {
            self.0 &= !other.0;
        }

        pub fn from_name(name: &str) -> Option<Self> {
            Self::NAMED
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, flag)| *flag)
        }

        pub fn names(self) -> Vec<&'static str> {
            Self::NAMED
                .iter()
                .filter(|(_, flag)| self.contains(*flag))
                .map(|(n, _)| *n)
                .collect()
        }
    }

    impl Default for ParseeTypes {
        fn default() -> Self {
            Self::ALL
        }
    }

    impl BitOr for ParseeTypes {
        type Output = Self;

        fn bitor(self, rhs: Self) -> Self {
            Self(self.0 | rhs.0)
        }
    }

    impl BitOrAssign for ParseeTypes {
        fn bitor_assign(&mut self, rhs: Self) {
            self.insert(rhs);
        }
    }

    impl fmt::Debug for ParseeTypes {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_set().entries(self.names()).finish()
        }
    }

    impl Serialize for ParseeTypes {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(self.names())
        }
    }

    impl<'de> Deserialize<'de> for ParseeTypes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let names = Vec::<String>::deserialize(deserializer)?;
            names.iter().try_fold(Self::EMPTY, |acc, name| {
                Self::from_name(name)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| de::Error::custom(format!("unknown construct {name:?}")))
            })
        }
    }

    /* ------------------------------ Literals ------------------------------ */

    pub mod values {
        pub const TODO: &str = "TODO";
        pub const DONE: &str = "DONE";
        pub const CANCELED: &str = "CANCELED";
        pub const SCHEDULED: &str = "SCHEDULED:";
        pub const DEADLINE: &str = "DEADLINE:";
        pub const ARCHIVE: &str = "ARCHIVE";
        pub const PROPERTIES: &str = "PROPERTIES";
        pub const PRIORITIES: [&str; 6] = ["[#A]", "[#B]", "[#C]", "[#D]", "[#E]", "[#F]"];

        pub const BEGIN_SRC: &str = "#+BEGIN_SRC";
        pub const END_SRC: &str = "#+END_SRC";
        pub const BEGIN_QUOTE: &str = "#+BEGIN_QUOTE";
        pub const END_QUOTE: &str = "#+END_QUOTE";
        pub const DRAWER_END: &str = ":END:";
        pub const ATTACHMENT: &str = "#+ATTACHMENT:";

        pub const CHECKBOX_CHECKED: &str = "[X]";
        pub const CHECKBOX_UNCHECKED: &str = "[ ]";
        pub const CHECKBOX_HALF: &str = "[-]";
        pub const UNORDERED_LIST: &str = "- ";
        pub const SEPARATOR: &str = "-----";

        pub const DOCUMENT_LINK_SCHEME: &str = "x3";

        /// Prefix for the list item following `prefix` (`"3. "` gives `"4. "`, `"b) "` gives `"c) "`).
        ///
        /// Numeric indexes count up; other indexes have each printable ASCII char bumped by one.
        /// Returns `None` when `prefix` is not an ordered-list prefix.
        pub fn ordered_list_increase(prefix: &str) -> Option<String> {
            let caps = super::ORDERED_LIST.captures(prefix)?;
            let index = caps.get(2)?;
            let bumped = match index.as_str().parse::<u64>() {
                Ok(n) => (n + 1).to_string(),
                Err(_) => index
                    .as_str()
                    .chars()
                    .map(|c| match c {
                        ' '..='}' => char::from_u32(c as u32 + 1).unwrap_or(c),
                        _ => c,
                    })
                    .collect(),
            };
            let mut out = String::with_capacity(prefix.len() + 1);
            out.push_str(&prefix[..index.start()]);
            out.push_str(&bumped);
            out.push_str(&prefix[index.end()..]);
            Some(out)
        }

        /// Ordered-list prefix for `index`.
        pub fn ordered_list(index: &str) -> String {
            format!("{index}. ")
        }
    }

    /* ------------------------------ Patterns ------------------------------ */

    fn compile(pattern: &str) -> Regex {
        Regex::new(pattern)
            .unwrap_or_else(|e| panic!("outline grammar pattern {pattern:?} is invalid: {e}"))
    }

    /// Groups: 1 level marks, 2 identifier, 3 rest of the line.
    pub static HEADING: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^(\*+)(?:\{id:([\w\-]*)\})? ([^\n]*)"));
    pub static PRIORITY: Lazy<Regex> = Lazy::new(|| compile(r"\[#[A-Z]\]"));
    pub static TAGS: Lazy<Regex> = Lazy::new(|| compile(r"(:(?:\w+:)+)[\t ]*$"));

    /// Groups: 1 token span, 2 status.
    pub static CHECKBOX: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*(- (\[[X \-]\]) )[^\n]*"));
    /// Group 1 prefix. Lines whose content starts with `[` are left to the checkbox pattern.
    pub static UNORDERED_LIST: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*([\-+] )(?:[^\[\n][^\n]*)?$"));
    /// Groups: 1 prefix, 2 index.
    pub static ORDERED_LIST: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*(([0-9a-zA-Z]{1,3})[.)>] )[^\n]*"));
    pub static SEPARATOR: Lazy<Regex> = Lazy::new(|| compile(r"(?m)^[\t ]*(-{5,}[\t ]*)$"));
    /// Groups: 1 type, 2 value.
    pub static ATTACHMENT: Lazy<Regex> = Lazy::new(|| {
        compile(r"#\+ATTACHMENT:(image|video|audio|sketch|location|link|text)=([A-Z0-9\-]+)")
    });

    /// Groups: 1 url, 2 scheme, 3 title. Never spans lines.
    pub static LINK: Lazy<Regex> =
        Lazy::new(|| compile(r"\[\[((http|https|x3):[^\]\[\n]*)\]\[([^\]\n]*)\]\]"));
    /// Candidates only. A match preceded by `[` belongs to a bracketed link and is skipped.
    pub static RAW_HTTP_LINK: Lazy<Regex> = Lazy::new(|| {
        compile(
            r"https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b[-a-zA-Z0-9()@:%_+.~#?&/=]*",
        )
    });

    /// Group 1 language.
    pub static CODE_BLOCK_BEGIN: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*#\+BEGIN_SRC(?: ([\w.]*))?[\t ]*"));
    pub static CODE_BLOCK_END: Lazy<Regex> = Lazy::new(|| compile(r"(?m)^[\t ]*#\+END_SRC[\t ]*"));
    pub static QUOTE_BLOCK_BEGIN: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*#\+BEGIN_QUOTE[\t ]*"));
    pub static QUOTE_BLOCK_END: Lazy<Regex> =
        Lazy::new(|| compile(r"(?m)^[\t ]*#\+END_QUOTE[\t ]*"));
    /// Group 1 drawer name. A name of `END` is a drawer end, not a begin.
    pub static DRAWER_BEGIN: Lazy<Regex> = Lazy::new(|| compile(r"(?m)^[\t ]*:(\w+):[\t ]*$"));
    pub static DRAWER_END: Lazy<Regex> = Lazy::new(|| compile(r"(?m)^[\t ]*:END:[\t ]*$"));
    /// Groups: 1 key, 2 value. One line of a property drawer.
    pub static PROPERTY_LINE: Lazy<Regex> =
        Lazy::new(|| compile(r"^[\t ]*:([^:\s]+):[\t ]*(.*?)[\t ]*$"));

    const DATE: &str = r"\d{4}-\d{1,2}-\d{1,2}";
    const WEEKDAY: &str = r" [A-Z][a-z]{2}";
    const TIME: &str = r"[0-9]{1,2}:[0-9]{1,2}";
    const REPEAT: &str = r" \+[0-9]+[dwmqy]";

    fn date_and_time_pattern() -> String {
        format!("<{DATE}(?:{WEEKDAY})?(?: {TIME})?(?:{REPEAT})?>")
    }

    fn time_range_pattern() -> String {
        format!("<{DATE}(?:{WEEKDAY})? {TIME}-{TIME}>")
    }

    /// A bracketed date stamp spanning the whole input.
    pub static DATE_AND_TIME_WHOLE: Lazy<Regex> =
        Lazy::new(|| compile(&format!("^{}$", date_and_time_pattern())));
    /// Group 1 the stamp.
    pub static SCHEDULE: Lazy<Regex> =
        Lazy::new(|| compile(&format!("SCHEDULED: ({})", date_and_time_pattern())));
    /// Group 1 the stamp.
    pub static DUE: Lazy<Regex> =
        Lazy::new(|| compile(&format!("DEADLINE: ({})", date_and_time_pattern())));
    pub static TIME_RANGE: Lazy<Regex> = Lazy::new(|| compile(&time_range_pattern()));
    /// The `hh:mm-hh:mm` part of a time range stamp.
    pub static TIME_RANGE_PART: Lazy<Regex> =
        Lazy::new(|| compile(&format!("({TIME})-({TIME})")));
    /// Groups: 1 start stamp, 2 end stamp.
    pub static DATE_RANGE: Lazy<Regex> = Lazy::new(|| {
        let stamp = date_and_time_pattern();
        compile(&format!("({stamp})--({stamp})"))
    });
    /// Any of the date forms, longest forms first.
    pub static ANY_DATE_AND_TIME: Lazy<Regex> = Lazy::new(|| {
        let stamp = date_and_time_pattern();
        compile(&format!(
            "SCHEDULED: {stamp}|DEADLINE: {stamp}|{stamp}--{stamp}|{}|{stamp}",
            time_range_pattern()
        ))
    });

    /// Unbounded candidate for one inline mark: delimiter, content, delimiter.
    /// Groups: 1 content.
    pub fn text_mark_pattern(delimiter: char) -> Regex {
        let d = regex::escape(&delimiter.to_string());
        compile(&format!(r#"{d}([^\n,'"{d}]*){d}"#))
    }

    pub static TEXT_MARKS: Lazy<Vec<(crate::core::MarkKind, Regex)>> = Lazy::new(|| {
        crate::core::MarkKind::ALL
            .iter()
            .map(|kind| (*kind, text_mark_pattern(kind.delimiter())))
            .collect()
    });

    const CJK_BOUNDARY: &str = "，。」「”；、《》";

    /// Chars allowed right before an opening mark delimiter.
    pub fn is_mark_pre(c: char) -> bool {
        c.is_whitespace() || " ({'\"\r\n".contains(c) || CJK_BOUNDARY.contains(c)
    }

    /// Chars allowed right after a closing mark delimiter.
    pub fn is_mark_post(c: char) -> bool {
        c.is_whitespace() || " -.,:!?')}\"\r\n".contains(c) || CJK_BOUNDARY.contains(c)
    }

    /* ------------------------------ Grammar ------------------------------ */

    /// Per-engine pattern state. Only the planning pattern depends on settings.
    #[derive(Debug, Clone)]
    pub struct Grammar {
        planning_keywords: Vec<String>,
        planning: Regex,
    }

    impl Grammar {
        pub fn new(custom_keywords: &[String]) -> Self {
            let planning_keywords = planning_keywords(custom_keywords);
            let planning = compile(&planning_pattern(&planning_keywords));
            Self {
                planning_keywords,
                planning,
            }
        }

        /// Recompile the planning pattern with a new set of custom keywords.
        pub fn reload_planning(&mut self, custom_keywords: &[String]) {
            *self = Self::new(custom_keywords);
        }

        /// Matches at the start of a heading line. Group 1 the keyword.
        pub fn planning(&self) -> &Regex {
            &self.planning
        }

        pub fn planning_keywords(&self) -> &[String] {
            &self.planning_keywords
        }
    }

    impl Default for Grammar {
        fn default() -> Self {
            Self::new(&[])
        }
    }

    fn planning_keywords(custom: &[String]) -> Vec<String> {
        let mut all: Vec<String> = [values::TODO, values::DONE, values::CANCELED]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for keyword in custom {
            let keyword = keyword.trim();
            if !keyword.is_empty() && !all.iter().any(|k| k == keyword) {
                all.push(keyword.to_string());
            }
        }
        all
    }

    fn planning_pattern(keywords: &[String]) -> String {
        let alternatives = keywords
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        format!(r"^\*+(?:\{{id:[\w\-]*\}})? ({alternatives})(?: |$)")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parsee_names_round_trip() {
            let set = ParseeTypes::HEADING | ParseeTypes::DRAWER;
            assert_eq!(set.names(), vec!["heading", "drawer"]);
            let json = serde_json::to_string(&set).unwrap();
            let back: ParseeTypes = serde_json::from_str(&json).unwrap();
            assert_eq!(back, set);
            assert!(serde_json::from_str::<ParseeTypes>(r#"["nope"]"#).is_err());
        }

        #[test]
        fn only_heading_leaves_out_headings() {
            assert!(!ParseeTypes::ONLY_HEADING.contains(ParseeTypes::HEADING));
            assert!(ParseeTypes::ONLY_HEADING.contains(ParseeTypes::LINK));
            assert!(ParseeTypes::ALL.contains(ParseeTypes::ONLY_HEADING));
        }

        #[test]
        fn planning_accepts_custom_keywords() {
            let mut grammar = Grammar::default();
            assert!(grammar.planning().is_match("* TODO write"));
            assert!(!grammar.planning().is_match("* WAIT write"));
            grammar.reload_planning(&["WAIT".into(), "A+B".into()]);
            assert!(grammar.planning().is_match("* WAIT write"));
            assert!(grammar.planning().is_match("** A+B"));
            assert!(!grammar.planning().is_match("* TODOS"));
            assert_eq!(grammar.planning_keywords().len(), 5);
        }

        #[test]
        fn links_stay_on_one_line() {
            assert!(LINK.is_match("[[https://a.com][title]]"));
            assert!(!LINK.is_match("[[https://a.com][two\nline]]"));
            assert!(!LINK.is_match("[[https://a.com\n/x][title]]"));
        }

        #[test]
        fn ordered_list_increase_numeric_and_alpha() {
            assert_eq!(values::ordered_list_increase("3. ").as_deref(), Some("4. "));
            assert_eq!(values::ordered_list_increase("  9) ").as_deref(), Some("  10) "));
            assert_eq!(values::ordered_list_increase("b> ").as_deref(), Some("c> "));
            assert_eq!(values::ordered_list_increase("- "), None);
        }

        #[test]
        fn date_patterns_cover_all_forms() {
            assert!(DATE_AND_TIME_WHOLE.is_match("<2024-03-15 Fri 09:00 +1w>"));
            assert!(!DATE_AND_TIME_WHOLE.is_match("x <2024-03-15>"));
            let found: Vec<&str> = ANY_DATE_AND_TIME
                .find_iter("SCHEDULED: <2024-03-15> and <2024-01-01>--<2024-01-03> <2024-02-02 Fri 10:00-11:30>")
                .map(|m| m.as_str())
                .collect();
            assert_eq!(
                found,
                vec![
                    "SCHEDULED: <2024-03-15>",
                    "<2024-01-01>--<2024-01-03>",
                    "<2024-02-02 Fri 10:00-11:30>"
                ]
            );
        }

        #[test]
        fn mark_boundaries() {
            assert!(is_mark_pre(' ') && is_mark_pre('(') && is_mark_pre('「'));
            assert!(!is_mark_pre('3'));
            assert!(is_mark_post('.') && is_mark_post('\n'));
            assert!(!is_mark_post('a'));
        }
    }
}

pub mod settings {
    //! User-facing configuration: extra planning keywords and enabled constructs.

    use crate::grammar::{ParseeTypes, values};
    use serde::{Deserialize, Serialize};
    use std::{fs, io, path::Path, path::PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct OutlineSettings {
        /// Keywords recognised after the heading marks in addition to `TODO`, `DONE`, `CANCELED`.
        pub custom_planning_keywords: Vec<String>,
        /// Keywords that mark a heading as finished.
        pub finished_planning_keywords: Vec<String>,
        pub enabled: ParseeTypes,
    }

    impl Default for OutlineSettings {
        fn default() -> Self {
            Self {
                custom_planning_keywords: Vec::new(),
                finished_planning_keywords: vec![
                    values::DONE.to_string(),
                    values::CANCELED.to_string(),
                ],
                enabled: ParseeTypes::ALL,
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("reading settings from {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("invalid settings: {0}")]
        Json(#[from] serde_json::Error),
    }

    impl OutlineSettings {
        pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
            Ok(serde_json::from_str(json)?)
        }

        pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
            let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_json_str(&text)
        }

        pub fn is_finished(&self, keyword: &str) -> bool {
            self.finished_planning_keywords.iter().any(|k| k == keyword)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Write;

        #[test]
        fn missing_fields_fall_back_to_defaults() {
            let s = OutlineSettings::from_json_str(r#"{"custom_planning_keywords":["WAIT"]}"#)
                .expect("parse");
            assert_eq!(s.custom_planning_keywords, vec!["WAIT"]);
            assert!(s.is_finished("DONE"));
            assert_eq!(s.enabled, ParseeTypes::ALL);
        }

        #[test]
        fn loads_from_file() {
            let mut file = tempfile::NamedTempFile::new().expect("tempfile");
            write!(file, r#"{{"enabled":["heading","link"]}}"#).expect("write");
            let s = OutlineSettings::from_path(file.path()).expect("load");
            assert_eq!(s.enabled, ParseeTypes::HEADING | ParseeTypes::LINK);
        }

        #[test]
        fn reports_io_and_json_errors() {
            let dir = tempfile::tempdir().expect("tempdir");
            let err = OutlineSettings::from_path(&dir.path().join("absent.json")).unwrap_err();
            assert!(matches!(err, SettingsError::Io { .. }));
            let err = OutlineSettings::from_json_str("{").unwrap_err();
            assert!(matches!(err, SettingsError::Json(_)));
        }
    }
}

pub mod date {
    //! Dates found in outline text: bare stamps, scheduled and deadline stamps, time ranges and date ranges.

    use crate::grammar;
    use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
    use nom::{
        IResult,
        bytes::complete::take_while,
        character::complete::{char, one_of, satisfy},
        combinator::{all_consuming, map_res, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------ Repeats ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(tag = "unit", content = "count", rename_all = "snake_case")]
    pub enum RepeatMode {
        #[default]
        None,
        Day(u32),
        Week(u32),
        Month(u32),
        Quarter(u32),
        Year(u32),
    }

    impl RepeatMode {
        /// Build from the unit letter of a `+N<unit>` mark. Unknown letters mean no repeat.
        pub fn from_parts(unit: char, count: u32) -> Self {
            match unit {
                'd' => RepeatMode::Day(count),
                'w' => RepeatMode::Week(count),
                'm' => RepeatMode::Month(count),
                'q' => RepeatMode::Quarter(count),
                'y' => RepeatMode::Year(count),
                _ => RepeatMode::None,
            }
        }

        pub fn count(self) -> u32 {
            match self {
                RepeatMode::None => 0,
                RepeatMode::Day(n)
                | RepeatMode::Week(n)
                | RepeatMode::Month(n)
                | RepeatMode::Quarter(n)
                | RepeatMode::Year(n) => n,
            }
        }

        /// `+1w` style mark, empty when not repeating.
        pub fn mark(self) -> String {
            let unit = match self {
                RepeatMode::None => return String::new(),
                RepeatMode::Day(_) => 'd',
                RepeatMode::Week(_) => 'w',
                RepeatMode::Month(_) => 'm',
                RepeatMode::Quarter(_) => 'q',
                RepeatMode::Year(_) => 'y',
            };
            format!("+{}{}", self.count(), unit)
        }

        pub fn is_repeating(self) -> bool {
            self.count() > 0
        }

        /// Length of one period in calendar units.
        fn period(self) -> Option<Period> {
            match self {
                _ if !self.is_repeating() => None,
                RepeatMode::Day(n) => Some(Period::Days(i64::from(n))),
                RepeatMode::Week(n) => Some(Period::Days(7 * i64::from(n))),
                RepeatMode::Month(n) => Some(Period::Months(i64::from(n))),
                RepeatMode::Quarter(n) => Some(Period::Months(3 * i64::from(n))),
                RepeatMode::Year(n) => Some(Period::Months(12 * i64::from(n))),
                RepeatMode::None => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Period {
        Days(i64),
        Months(i64),
    }

    impl Period {
        /// Whole periods from `from` to `to`, truncated toward zero.
        fn count_between(self, from: NaiveDateTime, to: NaiveDateTime) -> i64 {
            match self {
                Period::Days(n) => (to - from).num_days() / n,
                Period::Months(n) => months_between(from, to) / n,
            }
        }

        fn advance(self, date: NaiveDateTime, times: i64) -> Option<NaiveDateTime> {
            match self {
                Period::Days(n) => date.checked_add_signed(TimeDelta::try_days(n.checked_mul(times)?)?),
                Period::Months(n) => add_months(date, n.checked_mul(times)?),
            }
        }
    }

    fn months_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
        let mut months = (i64::from(to.year()) - i64::from(from.year())) * 12
            + (i64::from(to.month()) - i64::from(from.month()));
        let from_rest = (from.day(), from.time());
        let to_rest = (to.day(), to.time());
        if months > 0 && to_rest < from_rest {
            months -= 1;
        } else if months < 0 && to_rest > from_rest {
            months += 1;
        }
        months
    }

    fn add_months(date: NaiveDateTime, months: i64) -> Option<NaiveDateTime> {
        let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
        if months >= 0 {
            date.checked_add_months(magnitude)
        } else {
            date.checked_sub_months(magnitude)
        }
    }

    /* ------------------------------ Notices ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NoticeKind {
        OverDue,
        Start,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum AlertLevel {
        Normal,
        Attention,
        Urgent,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Notice {
        pub kind: NoticeKind,
        /// Calendar days from the reference date to `date`; negative in the past.
        pub days_count: i64,
        pub alert_level: AlertLevel,
        /// The occurrence the notice is about.
        pub date: NaiveDateTime,
    }

    impl Notice {
        pub fn message(&self) -> String {
            let days = self.days_count;
            match (self.kind, days) {
                (NoticeKind::OverDue, 0) => "due today".to_string(),
                (NoticeKind::OverDue, d) if d < 0 => format!("overdue by {} day(s)", -d),
                (NoticeKind::OverDue, d) => format!("due in {d} day(s)"),
                (NoticeKind::Start, 0) => "starts today".to_string(),
                (NoticeKind::Start, d) if d < 0 => format!("started {} day(s) ago", -d),
                (NoticeKind::Start, d) => format!("starts in {d} day(s)"),
            }
        }
    }

    /* ---------------------------- DateAndTime ---------------------------- */

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DateAndTime {
        pub date: NaiveDateTime,
        pub include_time: bool,
        pub repeat_mode: RepeatMode,
        pub is_due: bool,
        pub is_schedule: bool,
        /// Seconds from `date` to the end of a time or date range, 0 otherwise.
        pub duration: i64,
    }

    impl PartialEq for DateAndTime {
        fn eq(&self, other: &Self) -> bool {
            let minute = |d: &NaiveDateTime| (d.date(), d.hour(), d.minute());
            minute(&self.date) == minute(&other.date)
                && self.repeat_mode.mark() == other.repeat_mode.mark()
                && self.duration == other.duration
                && self.is_due == other.is_due
                && self.is_schedule == other.is_schedule
        }
    }

    impl Eq for DateAndTime {}

    impl DateAndTime {
        pub fn new(date: NaiveDateTime, include_time: bool, repeat_mode: RepeatMode) -> Self {
            Self {
                date,
                include_time,
                repeat_mode,
                is_due: false,
                is_schedule: false,
                duration: 0,
            }
        }

        /// Parse one date-and-time string. The forms are tried in order: a bare stamp
        /// covering the whole text, `SCHEDULED: <..>`, `DEADLINE: <..>`, a time range
        /// `<date hh:mm-hh:mm>` and a date range `<..>--<..>`.
        pub fn parse(text: &str) -> Option<DateAndTime> {
            Self::parse_bare(text)
                .or_else(|| Self::parse_prefixed(text, &grammar::SCHEDULE).map(Self::scheduled))
                .or_else(|| Self::parse_prefixed(text, &grammar::DUE).map(Self::due))
                .or_else(|| Self::parse_time_range(text))
                .or_else(|| Self::parse_date_range(text))
        }

        fn scheduled(mut self) -> Self {
            self.is_schedule = true;
            self
        }

        fn due(mut self) -> Self {
            self.is_due = true;
            self
        }

        fn parse_bare(text: &str) -> Option<DateAndTime> {
            if !grammar::DATE_AND_TIME_WHOLE.is_match(text) {
                return None;
            }
            let (_, (date, time, repeat_mode)) = all_consuming(parse_stamp)(text).ok()?;
            Some(DateAndTime::new(
                date.and_time(time.unwrap_or(NaiveTime::MIN)),
                time.is_some(),
                repeat_mode,
            ))
        }

        fn parse_prefixed(text: &str, pattern: &regex::Regex) -> Option<DateAndTime> {
            let caps = pattern.captures(text)?;
            Self::parse_bare(caps.get(1)?.as_str())
        }

        fn parse_time_range(text: &str) -> Option<DateAndTime> {
            let stamp = grammar::TIME_RANGE.find(text)?.as_str();
            let caps = grammar::TIME_RANGE_PART.captures(stamp)?;
            let part = caps.get(0)?;
            let with_time = |time: &str| {
                format!("{}{}{}", &stamp[..part.start()], time, &stamp[part.end()..])
            };
            let start = Self::parse_bare(&with_time(caps.get(1)?.as_str()))?;
            let end = Self::parse_bare(&with_time(caps.get(2)?.as_str()))?;
            Some(DateAndTime {
                duration: (end.date - start.date).num_seconds(),
                ..start
            })
        }

        fn parse_date_range(text: &str) -> Option<DateAndTime> {
            let caps = grammar::DATE_RANGE.captures(text)?;
            let start = Self::parse_bare(caps.get(1)?.as_str())?;
            let end = Self::parse_bare(caps.get(2)?.as_str())?;
            Some(DateAndTime {
                duration: (end.date - start.date).num_seconds(),
                ..start
            })
        }

        /// Nearest occurrence of a repeating date at or before `to`, or after `to` when
        /// `after` is set. Non-repeating dates return `date` unchanged.
        pub fn closest_date(&self, to: NaiveDateTime, after: bool) -> NaiveDateTime {
            let Some(period) = self.repeat_mode.period() else {
                return self.date;
            };
            let periods = period.count_between(self.date, to);
            let Some(mut candidate) = period.advance(self.date, periods) else {
                return self.date;
            };
            if after && candidate <= to {
                candidate = period.advance(candidate, 1).unwrap_or(candidate);
            } else if !after && candidate > to {
                candidate = period.advance(candidate, -1).unwrap_or(candidate);
            }
            candidate
        }

        /// Notice for an occurrence that is already past or at most three days ahead of `relative`.
        pub fn check_notice(&self, relative: NaiveDateTime) -> Option<Notice> {
            let date = if self.repeat_mode.is_repeating() {
                let before = self.closest_date(relative, false);
                let after = self.closest_date(relative, true);
                if (relative - before).abs() <= (after - relative).abs() {
                    before
                } else {
                    after
                }
            } else {
                self.date
            };

            let days_count = (date.date() - relative.date()).num_days();
            if date >= relative && days_count > 3 {
                return None;
            }

            let kind = if self.is_due {
                NoticeKind::OverDue
            } else {
                NoticeKind::Start
            };
            let alert_level = match days_count {
                d if d < 0 => AlertLevel::Urgent,
                1..=2 => AlertLevel::Attention,
                _ => AlertLevel::Normal,
            };
            Some(Notice {
                kind,
                days_count,
                alert_level,
                date,
            })
        }

        fn stamp_string(&self, date: NaiveDateTime) -> String {
            let mut out = format!("<{}", date.format("%Y-%m-%d"));
            if self.include_time {
                out.push_str(&date.format(" %H:%M").to_string());
            }
            let mark = self.repeat_mode.mark();
            if !mark.is_empty() {
                out.push(' ');
                out.push_str(&mark);
            }
            out.push('>');
            out
        }

        /// Text form that parses back to an equal value.
        pub fn mark_string(&self) -> String {
            let mut out = String::new();
            if self.is_schedule {
                out.push_str(grammar::values::SCHEDULED);
                out.push(' ');
            } else if self.is_due {
                out.push_str(grammar::values::DEADLINE);
                out.push(' ');
            }
            out.push_str(&self.stamp_string(self.date));
            if self.duration != 0 {
                let end = TimeDelta::try_seconds(self.duration)
                    .and_then(|d| self.date.checked_add_signed(d))
                    .unwrap_or(self.date);
                out.push_str("--");
                out.push_str(&self.stamp_string(end));
            }
            out
        }
    }

    impl fmt::Display for DateAndTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.include_time {
                write!(f, "{}", self.date.format("%b %d %H:%M"))
            } else {
                write!(f, "{}", self.date.format("%b %d"))
            }
        }
    }

    /* ----------------------------- Stamp parser ----------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// `<yyyy-m-d[ Www][ h:mm][ +N<unit>]>`
    fn parse_stamp(i: &str) -> PResult<'_, (NaiveDate, Option<NaiveTime>, RepeatMode)> {
        let (i, (date, _weekday, time, repeat)) = delimited(
            char('<'),
            tuple((
                parse_date,
                opt(preceded(char(' '), parse_weekday)),
                opt(preceded(char(' '), parse_time)),
                opt(preceded(char(' '), parse_repeat)),
            )),
            char('>'),
        )(i)?;
        Ok((i, (date, time, repeat.unwrap_or_default())))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_weekday(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            satisfy(|c| c.is_ascii_uppercase()),
            take_while_m_n(2, 2, |c: char| c.is_ascii_lowercase()),
        )))(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn parse_repeat(i: &str) -> PResult<'_, RepeatMode> {
        map_res(
            preceded(
                char('+'),
                tuple((take_while_m_n(1, 9, char_is_digit), one_of("dwmqy"))),
            ),
            |(count, unit): (&str, char)| {
                count
                    .parse::<u32>()
                    .map(|n| RepeatMode::from_parts(unit, n))
            },
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (rest, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap()
        }

        #[test]
        fn parses_bare_stamp_with_weekday_time_and_repeat() {
            let d = DateAndTime::parse("<2024-03-15 Fri 09:00 +1w>").expect("parse");
            assert_eq!(d.date, at(2024, 3, 15, 9, 0));
            assert!(d.include_time);
            assert_eq!(d.repeat_mode, RepeatMode::Week(1));
            assert!(!d.is_due && !d.is_schedule);
            assert_eq!(d.duration, 0);
        }

        #[test]
        fn parses_schedule_and_deadline() {
            let s = DateAndTime::parse("SCHEDULED: <2024-03-15>").expect("schedule");
            assert!(s.is_schedule && !s.is_due && !s.include_time);
            assert_eq!(s.date, at(2024, 3, 15, 0, 0));
            let d = DateAndTime::parse("DEADLINE: <2024-3-5 Tue 18:30 +2m>").expect("due");
            assert!(d.is_due);
            assert_eq!(d.date, at(2024, 3, 5, 18, 30));
            assert_eq!(d.repeat_mode, RepeatMode::Month(2));
        }

        #[test]
        fn parses_time_and_date_ranges() {
            let t = DateAndTime::parse("<2024-03-15 Fri 10:00-11:30>").expect("time range");
            assert_eq!(t.date, at(2024, 3, 15, 10, 0));
            assert_eq!(t.duration, 5400);
            let r = DateAndTime::parse("<2024-03-15>--<2024-03-17>").expect("date range");
            assert_eq!(r.date, at(2024, 3, 15, 0, 0));
            assert_eq!(r.duration, 2 * 24 * 3600);
        }

        #[test]
        fn rejects_invalid_input() {
            assert_eq!(DateAndTime::parse("<2024-02-30>"), None);
            assert_eq!(DateAndTime::parse("<2024-03-15 25:00>"), None);
            assert_eq!(DateAndTime::parse("tomorrow"), None);
            assert_eq!(DateAndTime::parse(""), None);
        }

        #[test]
        fn closest_date_monthly() {
            let d = DateAndTime::parse("<2024-01-01 +1m>").unwrap();
            let target = at(2024, 3, 20, 0, 0);
            assert_eq!(d.closest_date(target, false), at(2024, 3, 1, 0, 0));
            assert_eq!(d.closest_date(target, true), at(2024, 4, 1, 0, 0));
        }

        #[test]
        fn closest_date_weekly_and_before_start() {
            let d = DateAndTime::parse("<2024-03-01 +1w>").unwrap();
            let target = at(2024, 3, 20, 0, 0);
            assert_eq!(d.closest_date(target, false), at(2024, 3, 15, 0, 0));
            assert_eq!(d.closest_date(target, true), at(2024, 3, 22, 0, 0));

            let daily = DateAndTime::parse("<2024-05-01 +1d>").unwrap();
            let early = at(2024, 4, 20, 12, 0);
            assert_eq!(daily.closest_date(early, true), at(2024, 4, 21, 0, 0));
            assert_eq!(daily.closest_date(early, false), at(2024, 4, 20, 0, 0));
        }

        #[test]
        fn closest_date_without_repeat_is_identity() {
            let d = DateAndTime::parse("<2024-01-01>").unwrap();
            assert_eq!(d.closest_date(at(2030, 1, 1, 0, 0), true), d.date);
            let zero = DateAndTime::parse("<2024-01-01 +0d>").unwrap();
            assert_eq!(zero.closest_date(at(2030, 1, 1, 0, 0), true), zero.date);
        }

        #[test]
        fn notices_by_distance() {
            let now = at(2024, 3, 14, 10, 0);

            let tomorrow = DateAndTime::parse("DEADLINE: <2024-03-15 09:00>").unwrap();
            let n = tomorrow.check_notice(now).expect("notice");
            assert_eq!(n.kind, NoticeKind::OverDue);
            assert_eq!(n.days_count, 1);
            assert_eq!(n.alert_level, AlertLevel::Attention);

            let past = DateAndTime::parse("SCHEDULED: <2024-03-12>").unwrap();
            let n = past.check_notice(now).expect("notice");
            assert_eq!(n.kind, NoticeKind::Start);
            assert_eq!(n.days_count, -2);
            assert_eq!(n.alert_level, AlertLevel::Urgent);

            let today = DateAndTime::parse("DEADLINE: <2024-03-14>").unwrap();
            let n = today.check_notice(now).expect("notice");
            assert_eq!(n.days_count, 0);
            assert_eq!(n.alert_level, AlertLevel::Normal);
            assert_eq!(n.message(), "due today");

            let two_days = DateAndTime::parse("DEADLINE: <2024-03-16>").unwrap();
            let n = two_days.check_notice(now).expect("notice");
            assert_eq!(n.days_count, 2);
            assert_eq!(n.alert_level, AlertLevel::Attention);

            let three_days = DateAndTime::parse("DEADLINE: <2024-03-17>").unwrap();
            let n = three_days.check_notice(now).expect("notice");
            assert_eq!(n.days_count, 3);
            assert_eq!(n.alert_level, AlertLevel::Normal);

            let four_days = DateAndTime::parse("DEADLINE: <2024-03-18>").unwrap();
            assert_eq!(four_days.check_notice(now), None);

            let far = DateAndTime::parse("<2024-03-19>").unwrap();
            assert_eq!(far.check_notice(now), None);
        }

        #[test]
        fn repeating_notice_uses_nearest_occurrence() {
            let now = at(2024, 3, 14, 10, 0);
            let weekly = DateAndTime::parse("SCHEDULED: <2024-01-05 Fri +1w>").unwrap();
            let n = weekly.check_notice(now).expect("notice");
            assert_eq!(n.date, at(2024, 3, 15, 0, 0));
            assert_eq!(n.days_count, 1);
        }

        #[test]
        fn mark_string_parses_back() {
            for text in [
                "SCHEDULED: <2024-03-15 09:00 +1w>",
                "DEADLINE: <2024-03-15>",
                "<2024-03-15>--<2024-03-17>",
                "<2024-12-31 23:59 +3q>",
            ] {
                let d = DateAndTime::parse(text).expect("parse");
                assert_eq!(d.mark_string(), text);
                assert_eq!(DateAndTime::parse(&d.mark_string()), Some(d));
            }
        }

        #[test]
        fn display_is_short() {
            assert_eq!(
                DateAndTime::parse("<2024-03-15 Fri 09:00>").unwrap().to_string(),
                "Mar 15 09:00"
            );
            assert_eq!(DateAndTime::parse("<2024-03-05>").unwrap().to_string(), "Mar 05");
        }
    }
}

pub mod parser {
    //! Regex-driven scanner producing per-category match records for a range of text.
    //!
    //! The scanner is stateless apart from its grammar. Interpreting matches (building
    //! tokens, resolving overlaps between links and inline marks) is left to the consumer,
    //! usually through [`ParserDelegate`].

    use crate::core::{MarkKind, Role, TextRange};
    use crate::grammar::{self, Grammar, ParseeTypes};
    use crate::settings::OutlineSettings;
    use log::trace;
    use regex::{Captures, Match, Regex};
    use serde::Serialize;
    use std::collections::BTreeMap;

    /* ------------------------------ Results ------------------------------ */

    /// Construct categories in the order a parse pass reports them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Category {
        Heading,
        Checkbox,
        CodeBlockBegin,
        CodeBlockEnd,
        QuoteBlockBegin,
        QuoteBlockEnd,
        DrawerBegin,
        DrawerEnd,
        OrderedList,
        UnorderedList,
        Separator,
        Attachment,
        Link,
        RawHttpLink,
        DateAndTime,
        TextMark,
    }

    impl Category {
        pub const ORDER: [Category; 16] = [
            Category::Heading,
            Category::Checkbox,
            Category::CodeBlockBegin,
            Category::CodeBlockEnd,
            Category::QuoteBlockBegin,
            Category::QuoteBlockEnd,
            Category::DrawerBegin,
            Category::DrawerEnd,
            Category::OrderedList,
            Category::UnorderedList,
            Category::Separator,
            Category::Attachment,
            Category::Link,
            Category::RawHttpLink,
            Category::DateAndTime,
            Category::TextMark,
        ];

        /// Flag that enables this category.
        pub fn parsee(self) -> ParseeTypes {
            match self {
                Category::Heading => ParseeTypes::HEADING,
                Category::Checkbox => ParseeTypes::CHECKBOX,
                Category::CodeBlockBegin => ParseeTypes::CODE_BLOCK_BEGIN,
                Category::CodeBlockEnd => ParseeTypes::CODE_BLOCK_END,
                Category::QuoteBlockBegin => ParseeTypes::QUOTE_BLOCK_BEGIN,
                Category::QuoteBlockEnd => ParseeTypes::QUOTE_BLOCK_END,
                Category::DrawerBegin | Category::DrawerEnd => ParseeTypes::DRAWER,
                Category::OrderedList => ParseeTypes::ORDERED_LIST,
                Category::UnorderedList => ParseeTypes::UNORDERED_LIST,
                Category::Separator => ParseeTypes::SEPARATOR,
                Category::Attachment => ParseeTypes::ATTACHMENT,
                Category::Link => ParseeTypes::LINK,
                Category::RawHttpLink => ParseeTypes::RAW_HTTP_LINK,
                Category::DateAndTime => ParseeTypes::DATE_AND_TIME,
                Category::TextMark => ParseeTypes::TEXT_MARK,
            }
        }
    }

    /// One match: the whole span plus named sub-ranges, all in buffer coordinates.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct MatchRecord {
        pub range: TextRange,
        /// Set for inline marks.
        pub mark: Option<MarkKind>,
        pub roles: BTreeMap<Role, TextRange>,
    }

    impl MatchRecord {
        fn new(range: TextRange) -> Self {
            Self {
                range,
                mark: None,
                roles: BTreeMap::new(),
            }
        }

        fn with_role(mut self, role: Role, range: Option<TextRange>) -> Self {
            if let Some(range) = range {
                self.roles.insert(role, range);
            }
            self
        }

        pub fn role(&self, role: Role) -> Option<TextRange> {
            self.roles.get(&role).copied()
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct ParseResult {
        /// Range that was scanned.
        pub range: TextRange,
        /// Non-empty categories in [`Category::ORDER`].
        pub categories: Vec<(Category, Vec<MatchRecord>)>,
    }

    impl ParseResult {
        pub fn matches(&self, category: Category) -> &[MatchRecord] {
            self.categories
                .iter()
                .find(|(c, _)| *c == category)
                .map(|(_, m)| m.as_slice())
                .unwrap_or(&[])
        }

        pub fn is_empty(&self) -> bool {
            self.categories.is_empty()
        }

        /// Total number of matches across categories.
        pub fn len(&self) -> usize {
            self.categories.iter().map(|(_, m)| m.len()).sum()
        }

        /// Replay the result as delegate callbacks, in category order.
        pub fn deliver<D: ParserDelegate + ?Sized>(&self, text: &str, delegate: &mut D) {
            delegate.did_start_parsing(text);
            for (category, matches) in &self.categories {
                match category {
                    Category::Heading => delegate.did_find_headings(text, matches),
                    Category::Checkbox => delegate.did_find_checkboxes(text, matches),
                    Category::CodeBlockBegin => delegate.did_find_code_block_begins(text, matches),
                    Category::CodeBlockEnd => delegate.did_find_code_block_ends(text, matches),
                    Category::QuoteBlockBegin => {
                        delegate.did_find_quote_block_begins(text, matches)
                    }
                    Category::QuoteBlockEnd => delegate.did_find_quote_block_ends(text, matches),
                    Category::DrawerBegin => delegate.did_find_drawer_begins(text, matches),
                    Category::DrawerEnd => delegate.did_find_drawer_ends(text, matches),
                    Category::OrderedList => delegate.did_find_ordered_lists(text, matches),
                    Category::UnorderedList => delegate.did_find_unordered_lists(text, matches),
                    Category::Separator => delegate.did_find_separators(text, matches),
                    Category::Attachment => delegate.did_find_attachments(text, matches),
                    Category::Link => delegate.did_find_links(text, matches),
                    Category::RawHttpLink => delegate.did_find_raw_http_links(text, matches),
                    Category::DateAndTime => delegate.did_find_date_and_times(text, matches),
                    Category::TextMark => delegate.did_find_text_marks(text, matches),
                }
            }
            delegate.did_complete_parsing(text);
        }
    }

    /// Receiver for [`ParseResult::deliver`]. Every callback defaults to doing nothing.
    pub trait ParserDelegate {
        fn did_start_parsing(&mut self, _text: &str) {}
        fn did_find_headings(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_checkboxes(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_code_block_begins(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_code_block_ends(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_quote_block_begins(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_quote_block_ends(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_drawer_begins(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_drawer_ends(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_ordered_lists(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_unordered_lists(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_separators(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_attachments(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_links(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_raw_http_links(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_date_and_times(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_find_text_marks(&mut self, _text: &str, _matches: &[MatchRecord]) {}
        fn did_complete_parsing(&mut self, _text: &str) {}
    }

    /// Spans that inline marks must not overlap (link text, heading level marks).
    #[derive(Debug, Clone, Default)]
    pub struct IgnoreRanges(Vec<TextRange>);

    impl IgnoreRanges {
        pub fn push(&mut self, range: TextRange) {
            self.0.push(range);
        }

        pub fn clear(&mut self) {
            self.0.clear();
        }

        pub fn covers(&self, range: &TextRange) -> bool {
            self.0.iter().any(|r| r.intersects(range))
        }
    }

    /* ------------------------------ Parser ------------------------------ */

    #[derive(Debug, Clone, Default)]
    pub struct OutlineParser {
        grammar: Grammar,
        include: ParseeTypes,
    }

    impl OutlineParser {
        pub fn new(settings: &OutlineSettings) -> Self {
            Self {
                grammar: Grammar::new(&settings.custom_planning_keywords),
                include: settings.enabled,
            }
        }

        pub fn with_grammar(grammar: Grammar, include: ParseeTypes) -> Self {
            Self { grammar, include }
        }

        pub fn grammar(&self) -> &Grammar {
            &self.grammar
        }

        pub fn include(&self) -> ParseeTypes {
            self.include
        }

        pub fn set_include(&mut self, include: ParseeTypes) {
            self.include = include;
        }

        pub fn reload_planning_keywords(&mut self, custom_keywords: &[String]) {
            self.grammar.reload_planning(custom_keywords);
        }

        /// Scan `range` of `text` (the whole text when `None`).
        ///
        /// Panics when the range is out of bounds or splits a character.
        pub fn parse(&self, text: &str, range: Option<TextRange>) -> ParseResult {
            let range = range.unwrap_or(TextRange::new(0, text.len()));
            let scope = Scope {
                text: &text[range.as_range()],
                base: range.location,
            };

            let mut categories = Vec::new();
            for category in Category::ORDER {
                if !self.include.contains(category.parsee()) {
                    continue;
                }
                let matches = self.scan(category, &scope);
                if !matches.is_empty() {
                    trace!("{category:?}: {} match(es) in {range:?}", matches.len());
                    categories.push((category, matches));
                }
            }
            ParseResult { range, categories }
        }

        fn scan(&self, category: Category, scope: &Scope<'_>) -> Vec<MatchRecord> {
            match category {
                Category::Heading => self.scan_headings(scope),
                Category::Checkbox => scope.each(&grammar::CHECKBOX, |s, caps| {
                    let span = s.group(caps, 1)?;
                    Some(MatchRecord::new(span).with_role(Role::Status, s.group(caps, 2)))
                }),
                Category::CodeBlockBegin => scope.each(&grammar::CODE_BLOCK_BEGIN, |s, caps| {
                    let language = s.group(caps, 1).filter(|r| !r.is_empty());
                    Some(MatchRecord::new(s.group(caps, 0)?).with_role(Role::Language, language))
                }),
                Category::CodeBlockEnd => scope.whole(&grammar::CODE_BLOCK_END),
                Category::QuoteBlockBegin => scope.whole(&grammar::QUOTE_BLOCK_BEGIN),
                Category::QuoteBlockEnd => scope.whole(&grammar::QUOTE_BLOCK_END),
                Category::DrawerBegin => scope.each(&grammar::DRAWER_BEGIN, |s, caps| {
                    let name = caps.get(1)?;
                    if name.as_str() == "END" {
                        return None;
                    }
                    Some(MatchRecord::new(s.group(caps, 0)?).with_role(Role::DrawerName, Some(s.span(name))))
                }),
                Category::DrawerEnd => scope.whole(&grammar::DRAWER_END),
                Category::OrderedList => scope.each(&grammar::ORDERED_LIST, |s, caps| {
                    Some(
                        MatchRecord::new(s.group(caps, 0)?)
                            .with_role(Role::Prefix, s.group(caps, 1))
                            .with_role(Role::Index, s.group(caps, 2)),
                    )
                }),
                Category::UnorderedList => scope.each(&grammar::UNORDERED_LIST, |s, caps| {
                    Some(MatchRecord::new(s.group(caps, 0)?).with_role(Role::Prefix, s.group(caps, 1)))
                }),
                Category::Separator => scope.each(&grammar::SEPARATOR, |s, caps| {
                    Some(MatchRecord::new(s.group(caps, 1)?))
                }),
                Category::Attachment => scope.each(&grammar::ATTACHMENT, |s, caps| {
                    Some(
                        MatchRecord::new(s.group(caps, 0)?)
                            .with_role(Role::AttachmentType, s.group(caps, 1))
                            .with_role(Role::AttachmentValue, s.group(caps, 2)),
                    )
                }),
                Category::Link => scope.each(&grammar::LINK, |s, caps| {
                    Some(
                        MatchRecord::new(s.group(caps, 0)?)
                            .with_role(Role::Url, s.group(caps, 1))
                            .with_role(Role::Scheme, s.group(caps, 2))
                            .with_role(Role::Title, s.group(caps, 3)),
                    )
                }),
                Category::RawHttpLink => scope.scan_bounded(&grammar::RAW_HTTP_LINK, |s, m| {
                    let preceded_by_bracket = s.text[..m.start()].ends_with('[');
                    (!preceded_by_bracket).then(|| {
                        let span = s.span(m);
                        let scheme = m.as_str().find(':').map(|n| span.head(n));
                        MatchRecord::new(span)
                            .with_role(Role::Url, Some(span))
                            .with_role(Role::Scheme, scheme)
                    })
                }),
                Category::DateAndTime => scope.whole(&grammar::ANY_DATE_AND_TIME),
                Category::TextMark => grammar::TEXT_MARKS
                    .iter()
                    .flat_map(|(kind, pattern)| scope.scan_marks(*kind, pattern))
                    .collect(),
            }
        }

        /// Line first, then planning, tags, priority and identifier within that line.
        fn scan_headings(&self, scope: &Scope<'_>) -> Vec<MatchRecord> {
            scope.each(&grammar::HEADING, |s, caps| {
                let line = caps.get(0)?;
                let within = Scope {
                    text: line.as_str(),
                    base: s.base + line.start(),
                };
                let planning = self
                    .grammar
                    .planning()
                    .captures(within.text)
                    .and_then(|c| within.group(&c, 1));
                let tags = grammar::TAGS
                    .captures(within.text)
                    .and_then(|c| within.group(&c, 1));
                let priority = grammar::PRIORITY.find(within.text).map(|m| within.span(m));
                Some(
                    MatchRecord::new(s.span(line))
                        .with_role(Role::Level, s.group(caps, 1))
                        .with_role(Role::Identifier, s.group(caps, 2))
                        .with_role(Role::Content, s.group(caps, 3))
                        .with_role(Role::Planning, planning)
                        .with_role(Role::Tags, tags)
                        .with_role(Role::Priority, priority),
                )
            })
        }
    }

    /// Slice of the buffer being scanned and its offset in the buffer.
    struct Scope<'t> {
        text: &'t str,
        base: usize,
    }

    impl<'t> Scope<'t> {
        fn span(&self, m: Match<'_>) -> TextRange {
            TextRange::new(self.base + m.start(), m.len())
        }

        fn group(&self, caps: &Captures<'_>, i: usize) -> Option<TextRange> {
            caps.get(i).map(|m| self.span(m))
        }

        fn each<F>(&self, pattern: &Regex, mut build: F) -> Vec<MatchRecord>
        where
            F: FnMut(&Self, &Captures<'t>) -> Option<MatchRecord>,
        {
            pattern
                .captures_iter(self.text)
                .filter_map(|caps| build(self, &caps))
                .collect()
        }

        fn whole(&self, pattern: &Regex) -> Vec<MatchRecord> {
            pattern
                .find_iter(self.text)
                .map(|m| MatchRecord::new(self.span(m)))
                .collect()
        }

        /// Like `find_iter`, but a rejected candidate resumes the search one char after
        /// its start instead of after its end.
        fn scan_bounded<F>(&self, pattern: &Regex, mut accept: F) -> Vec<MatchRecord>
        where
            F: FnMut(&Self, Match<'t>) -> Option<MatchRecord>,
        {
            let mut out = Vec::new();
            let mut at = 0;
            while at <= self.text.len() {
                let Some(m) = pattern.find_at(self.text, at) else {
                    break;
                };
                match accept(self, m) {
                    Some(record) => {
                        out.push(record);
                        at = if m.is_empty() { self.next_char(m.end()) } else { m.end() };
                    }
                    None => at = self.next_char(m.start()),
                }
            }
            out
        }

        fn next_char(&self, at: usize) -> usize {
            at + self.text[at..].chars().next().map_or(1, char::len_utf8)
        }

        /// Inline marks of one kind, bounded by whitespace or punctuation on both sides.
        // The scope start counts as a boundary; storage only re-parses whole lines.
        fn scan_marks(&self, kind: MarkKind, pattern: &Regex) -> Vec<MatchRecord> {
            self.scan_bounded(pattern, |s, m| {
                let before = s.text[..m.start()].chars().next_back();
                let after = s.text[m.end()..].chars().next();
                let bounded = before.is_none_or(grammar::is_mark_pre)
                    && after.is_none_or(grammar::is_mark_post);
                if !bounded {
                    return None;
                }
                let open = kind.delimiter().len_utf8();
                let span = s.span(m);
                let mut record = MatchRecord::new(span).with_role(
                    Role::Content,
                    Some(TextRange::new(span.location + open, span.length - 2 * open)),
                );
                record.mark = Some(kind);
                Some(record)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn parse(text: &str) -> ParseResult {
            OutlineParser::default().parse(text, None)
        }

        fn texts<'a>(text: &'a str, matches: &[MatchRecord]) -> Vec<&'a str> {
            matches.iter().map(|m| &text[m.range.as_range()]).collect()
        }

        #[test]
        fn heading_roles() {
            let text = "** TODO [#A] Write the report :work:urgent:\nbody";
            let result = parse(text);
            let headings = result.matches(Category::Heading);
            assert_eq!(headings.len(), 1);
            let h = &headings[0];
            assert_eq!(h.range, TextRange::new(0, 43));
            let role = |r| &text[h.role(r).unwrap().as_range()];
            assert_eq!(role(Role::Level), "**");
            assert_eq!(role(Role::Planning), "TODO");
            assert_eq!(role(Role::Priority), "[#A]");
            assert_eq!(role(Role::Tags), ":work:urgent:");
            assert_eq!(h.role(Role::Identifier), None);
        }

        #[test]
        fn heading_identifier_and_non_headings() {
            let text = "*{id:abc-1} Title\n*bold* line\n*not heading";
            let headings = parse(text).matches(Category::Heading).to_vec();
            assert_eq!(headings.len(), 1);
            assert_eq!(&text[headings[0].role(Role::Identifier).unwrap().as_range()], "abc-1");
        }

        #[test]
        fn custom_planning_keyword() {
            let settings = OutlineSettings {
                custom_planning_keywords: vec!["WAIT".into()],
                ..OutlineSettings::default()
            };
            let text = "* WAIT reply";
            let result = OutlineParser::new(&settings).parse(text, None);
            let h = &result.matches(Category::Heading)[0];
            assert_eq!(&text[h.role(Role::Planning).unwrap().as_range()], "WAIT");
            let plain = parse(text);
            assert_eq!(plain.matches(Category::Heading)[0].role(Role::Planning), None);
        }

        #[test]
        fn planning_keyword_only_after_level_marks() {
            let text = "* Write TODO list";
            let result = parse(text);
            let h = &result.matches(Category::Heading)[0];
            assert_eq!(h.role(Role::Planning), None);
        }

        #[test]
        fn list_lines() {
            let text = "- [X] done\n- plain\n+ \n3. third\n  b) nested\n-----\n- [link]";
            let result = parse(text);
            let checkbox = &result.matches(Category::Checkbox)[0];
            assert_eq!(&text[checkbox.range.as_range()], "- [X] ");
            assert_eq!(&text[checkbox.role(Role::Status).unwrap().as_range()], "[X]");
            assert_eq!(
                texts(text, result.matches(Category::UnorderedList)),
                vec!["- plain", "+ "]
            );
            let ordered = result.matches(Category::OrderedList);
            assert_eq!(texts(text, ordered), vec!["3. third", "  b) nested"]);
            assert_eq!(&text[ordered[1].role(Role::Index).unwrap().as_range()], "b");
            assert_eq!(texts(text, result.matches(Category::Separator)), vec!["-----"]);
        }

        #[test]
        fn blocks_and_drawers() {
            let text = "#+BEGIN_SRC rust\nfn x() {}\n#+END_SRC\n#+BEGIN_QUOTE\nq\n#+END_QUOTE\n:PROPERTIES:\n:ID: 1\n:END:";
            let result = parse(text);
            let begin = &result.matches(Category::CodeBlockBegin)[0];
            assert_eq!(&text[begin.role(Role::Language).unwrap().as_range()], "rust");
            assert_eq!(result.matches(Category::CodeBlockEnd).len(), 1);
            assert_eq!(result.matches(Category::QuoteBlockBegin).len(), 1);
            assert_eq!(result.matches(Category::QuoteBlockEnd).len(), 1);
            let drawer = result.matches(Category::DrawerBegin);
            assert_eq!(drawer.len(), 1);
            assert_eq!(&text[drawer[0].role(Role::DrawerName).unwrap().as_range()], "PROPERTIES");
            assert_eq!(result.matches(Category::DrawerEnd).len(), 1);
        }

        #[test]
        fn links_and_raw_links() {
            let text = "see [[https://a.com/x][A site]] and https://www.b.org/path?q=1 now";
            let result = parse(text);
            let link = &result.matches(Category::Link)[0];
            assert_eq!(&text[link.role(Role::Url).unwrap().as_range()], "https://a.com/x");
            assert_eq!(&text[link.role(Role::Scheme).unwrap().as_range()], "https");
            assert_eq!(&text[link.role(Role::Title).unwrap().as_range()], "A site");
            assert_eq!(
                texts(text, result.matches(Category::RawHttpLink)),
                vec!["https://www.b.org/path?q=1"]
            );
        }

        #[test]
        fn attachments_and_dates() {
            let text = "#+ATTACHMENT:image=AB-12\nSCHEDULED: <2024-03-15 Fri> <2024-01-01>";
            let result = parse(text);
            let a = &result.matches(Category::Attachment)[0];
            assert_eq!(&text[a.role(Role::AttachmentType).unwrap().as_range()], "image");
            assert_eq!(&text[a.role(Role::AttachmentValue).unwrap().as_range()], "AB-12");
            assert_eq!(
                texts(text, result.matches(Category::DateAndTime)),
                vec!["SCHEDULED: <2024-03-15 Fri>", "<2024-01-01>"]
            );
        }

        #[test]
        fn text_mark_boundaries() {
            let text = "a *bold* and 3*4*5, (/it/) _u_. +s+ =v= ~h~\n「*cjk*」";
            let result = parse(text);
            let marks = result.matches(Category::TextMark);
            let found: Vec<(MarkKind, &str)> = marks
                .iter()
                .map(|m| (m.mark.unwrap(), &text[m.range.as_range()]))
                .collect();
            assert_eq!(
                found,
                vec![
                    (MarkKind::Bold, "*bold*"),
                    (MarkKind::Bold, "*cjk*"),
                    (MarkKind::Italic, "/it/"),
                    (MarkKind::Underscore, "_u_"),
                    (MarkKind::Strikethrough, "+s+"),
                    (MarkKind::Verbatim, "=v="),
                    (MarkKind::Highlight, "~h~"),
                ]
            );
            let bold = &marks[0];
            assert_eq!(&text[bold.role(Role::Content).unwrap().as_range()], "bold");
        }

        #[test]
        fn rejected_candidate_resumes_next_char() {
            let text = "x*a* *b*";
            let marks = parse(text).matches(Category::TextMark).to_vec();
            assert_eq!(texts(text, &marks), vec!["*b*"]);
        }

        #[test]
        fn sub_range_offsets_are_absolute() {
            let text = "intro line\n* Heading\n";
            let result = OutlineParser::default().parse(text, Some(TextRange::new(11, 9)));
            assert_eq!(result.range, TextRange::new(11, 9));
            let h = &result.matches(Category::Heading)[0];
            assert_eq!(h.range, TextRange::new(11, 9));
            assert_eq!(h.role(Role::Level), Some(TextRange::new(11, 1)));
        }

        #[test]
        fn disabled_categories_are_skipped() {
            let parser = OutlineParser::with_grammar(Grammar::default(), ParseeTypes::HEADING);
            let result = parser.parse("* a *b*\n- item", None);
            assert_eq!(result.categories.len(), 1);
            assert_eq!(result.categories[0].0, Category::Heading);
            assert!(parser.parse("", None).is_empty());
        }

        #[derive(Default)]
        struct Recorder(Vec<String>);

        impl ParserDelegate for Recorder {
            fn did_start_parsing(&mut self, _text: &str) {
                self.0.push("start".into());
            }
            fn did_find_headings(&mut self, _text: &str, matches: &[MatchRecord]) {
                self.0.push(format!("headings:{}", matches.len()));
            }
            fn did_find_links(&mut self, _text: &str, matches: &[MatchRecord]) {
                self.0.push(format!("links:{}", matches.len()));
            }
            fn did_complete_parsing(&mut self, _text: &str) {
                self.0.push("complete".into());
            }
        }

        #[test]
        fn deliver_replays_in_order() {
            let text = "* a\n* b [[x3:doc][d]]";
            let result = parse(text);
            let mut recorder = Recorder::default();
            result.deliver(text, &mut recorder);
            assert_eq!(recorder.0, vec!["start", "headings:2", "links:1", "complete"]);
        }
    }
}

pub mod storage {
    //! Incremental token store for one outline document.
    //!
    //! [`OutlineStorage`] owns the text and every token found in it. An edit invalidates the
    //! tokens it destroyed, shifts the ones after it, re-parses the smallest safe range
    //! around it (whole lines, widened to any block it touches) and splices the new tokens
    //! back into the position-sorted caches.

    use crate::core::{BlockKind, HeadingData, OutlineError, Role, TextRange, Token, TokenId, TokenKind};
    use crate::date::DateAndTime;
    use crate::grammar;
    use crate::parser::{IgnoreRanges, MatchRecord, OutlineParser, ParserDelegate};
    use crate::settings::OutlineSettings;
    use indexmap::IndexMap;
    use log::{debug, trace};
    use std::collections::{HashMap, HashSet};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------ Seams ------------------------------ */

    /// Regions hidden from implicit re-parsing (for example collapsed sections).
    pub trait FoldedRegions {
        /// Folded region containing `location`, if any.
        fn folded_range(&self, location: usize) -> Option<TextRange>;

        /// Called after each edit so stored ranges can follow the text.
        fn did_edit(&mut self, _edited: TextRange, _delta: isize) {}
    }

    /// Nothing is ever folded.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoFolding;

    impl FoldedRegions for NoFolding {
        fn folded_range(&self, _location: usize) -> Option<TextRange> {
            None
        }
    }

    /// Plain list of folded ranges that shift with edits.
    #[derive(Debug, Clone, Default)]
    pub struct FoldedRanges {
        ranges: Vec<TextRange>,
    }

    impl FoldedRanges {
        pub fn fold(&mut self, range: TextRange) {
            self.ranges.push(range);
        }

        /// Remove every fold containing `location`.
        pub fn unfold(&mut self, location: usize) {
            self.ranges.retain(|r| !r.contains(location));
        }

        pub fn ranges(&self) -> &[TextRange] {
            &self.ranges
        }
    }

    impl FoldedRegions for FoldedRanges {
        fn folded_range(&self, location: usize) -> Option<TextRange> {
            self.ranges.iter().copied().find(|r| r.contains(location))
        }

        fn did_edit(&mut self, edited: TextRange, delta: isize) {
            let replaced_end = edited.upper_bound().saturating_add_signed(-delta);
            let map = |at: usize| {
                if at >= replaced_end {
                    at.saturating_add_signed(delta)
                } else {
                    at.min(edited.upper_bound())
                }
            };
            for r in &mut self.ranges {
                *r = TextRange::from_bounds(map(r.location), map(r.upper_bound()));
            }
            self.ranges.retain(|r| !r.is_empty());
        }
    }

    /// Notified when an edit changes the set of headings.
    pub trait OutlineObserver {
        fn did_update_headings(&mut self, added: &[Token], removed: &[Token]);
    }

    /// What one edit did to the caches.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct EditOutcome {
        /// Range that was re-parsed, in post-edit coordinates.
        pub parse_range: TextRange,
        pub added_headings: Vec<Token>,
        pub removed_headings: Vec<Token>,
    }

    /* ------------------------------ Caches ------------------------------ */

    /// Begin and end markers of one block kind, plus the begin/end pairing between them.
    #[derive(Debug, Clone, Default)]
    struct BlockCache {
        tokens: Vec<TokenId>,
        begin_to_end: HashMap<TokenId, TokenId>,
        end_to_begin: HashMap<TokenId, TokenId>,
    }

    impl BlockCache {
        /// Pair every begin immediately followed by an end. Returns pairs that did not exist before.
        fn repair(&mut self, arena: &IndexMap<TokenId, Token>) -> Vec<(TokenId, TokenId)> {
            let previous = std::mem::take(&mut self.begin_to_end);
            self.end_to_begin.clear();
            let mut formed = Vec::new();
            for window in self.tokens.windows(2) {
                let (begin, end) = (window[0], window[1]);
                if arena[&begin].is_block_begin() && arena[&end].is_block_end() {
                    self.begin_to_end.insert(begin, end);
                    self.end_to_begin.insert(end, begin);
                    if previous.get(&begin) != Some(&end) {
                        formed.push((begin, end));
                    }
                }
            }
            formed
        }

        fn partner(&self, id: TokenId) -> Option<TokenId> {
            self.begin_to_end
                .get(&id)
                .or_else(|| self.end_to_begin.get(&id))
                .copied()
        }

        fn pairs(&self) -> impl Iterator<Item = (TokenId, TokenId)> + '_ {
            self.tokens
                .iter()
                .filter_map(|b| self.begin_to_end.get(b).map(|e| (*b, *e)))
        }
    }

    fn is_stale(range: TextRange, window: TextRange) -> bool {
        range.intersects(&window) || range.upper_bound() == window.location
    }

    /// Drop stale entries from `cache` and splice the sorted `fresh` ids in. Returns the dropped ids.
    fn merge_cache(
        cache: &mut Vec<TokenId>,
        arena: &IndexMap<TokenId, Token>,
        window: TextRange,
        fresh: &[TokenId],
    ) -> Vec<TokenId> {
        let mut dropped = Vec::new();
        cache.retain(|id| {
            let stale = is_stale(arena[id].range(), window);
            if stale {
                dropped.push(*id);
            }
            !stale
        });
        if let Some(first) = fresh.first() {
            let key = arena[first].sort_key();
            let at = cache.partition_point(|id| arena[id].sort_key() < key);
            cache.splice(at..at, fresh.iter().copied());
        }
        dropped
    }

    /* ------------------------------ Storage ------------------------------ */

    pub struct OutlineStorage {
        text: String,
        settings: OutlineSettings,
        parser: OutlineParser,
        arena: IndexMap<TokenId, Token>,
        all_tokens: Vec<TokenId>,
        heading_tokens: Vec<TokenId>,
        blocks: [BlockCache; 3],
        next_id: u64,
        folding: Box<dyn FoldedRegions + Send>,
        observers: Vec<Box<dyn OutlineObserver + Send>>,
    }

    impl fmt::Debug for OutlineStorage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("OutlineStorage")
                .field("len", &self.text.len())
                .field("tokens", &self.all_tokens.len())
                .field("headings", &self.heading_tokens.len())
                .field("observers", &self.observers.len())
                .finish()
        }
    }

    impl OutlineStorage {
        /// Take ownership of `text` and parse all of it.
        pub fn new(text: impl Into<String>, settings: OutlineSettings) -> Self {
            let parser = OutlineParser::new(&settings);
            Self::with_parser(text, settings, parser)
        }

        pub fn with_parser(
            text: impl Into<String>,
            settings: OutlineSettings,
            parser: OutlineParser,
        ) -> Self {
            let mut storage = Self {
                text: text.into(),
                settings,
                parser,
                arena: IndexMap::new(),
                all_tokens: Vec::new(),
                heading_tokens: Vec::new(),
                blocks: Default::default(),
                next_id: 0,
                folding: Box::new(NoFolding),
                observers: Vec::new(),
            };
            storage.reparse_all();
            storage
        }

        pub fn set_folding(&mut self, folding: Box<dyn FoldedRegions + Send>) {
            self.folding = folding;
        }

        pub fn add_observer(&mut self, observer: Box<dyn OutlineObserver + Send>) {
            self.observers.push(observer);
        }

        pub fn settings(&self) -> &OutlineSettings {
            &self.settings
        }

        /// Use a new set of custom planning keywords from the next parse on.
        pub fn reload_planning_keywords(&mut self, keywords: Vec<String>) {
            self.parser.reload_planning_keywords(&keywords);
            self.settings.custom_planning_keywords = keywords;
        }

        /// Drop every token and parse the whole text again.
        pub fn reparse_all(&mut self) -> EditOutcome {
            let removed: Vec<Token> = self
                .heading_tokens
                .iter()
                .map(|id| self.arena[id].clone())
                .collect();
            self.arena.clear();
            self.all_tokens.clear();
            self.heading_tokens.clear();
            self.blocks = Default::default();
            let range = TextRange::new(0, self.text.len());
            self.reparse(range, removed)
        }

        /* --------------------------- Editing --------------------------- */

        /// Replace `range` (current coordinates) with `replacement`.
        pub fn try_replace(
            &mut self,
            range: TextRange,
            replacement: &str,
        ) -> Result<EditOutcome, OutlineError> {
            let len = self.text.len();
            if range.upper_bound() > len {
                return Err(OutlineError::RangeOutOfBounds {
                    start: range.location,
                    end: range.upper_bound(),
                    len,
                });
            }
            for at in [range.location, range.upper_bound()] {
                if !self.text.is_char_boundary(at) {
                    return Err(OutlineError::NotCharBoundary(at));
                }
            }
            let delta = replacement.len() as isize - range.length as isize;
            Ok(self.apply_edit(
                TextRange::new(range.location, replacement.len()),
                replacement,
                delta,
            ))
        }

        /// [`Self::try_replace`] for callers that guarantee a valid range. Panics otherwise.
        pub fn replace(&mut self, range: TextRange, replacement: &str) -> EditOutcome {
            match self.try_replace(range, replacement) {
                Ok(outcome) => outcome,
                Err(e) => panic!("invalid edit: {e}"),
            }
        }

        /// Apply an edit described in post-edit coordinates: `edited` covers `replacement`
        /// and `delta` is the change in text length. Panics on inconsistent arguments.
        pub fn apply_edit(&mut self, edited: TextRange, replacement: &str, delta: isize) -> EditOutcome {
            assert_eq!(
                edited.length,
                replacement.len(),
                "edited range must cover the replacement"
            );
            let replaced_len = edited.length as isize - delta;
            assert!(replaced_len >= 0, "delta {delta} exceeds the edited range");
            let replaced = edited.location..edited.location + replaced_len as usize;
            assert!(
                replaced.end <= self.text.len(),
                "edit {replaced:?} is outside the buffer (length {})",
                self.text.len()
            );
            self.text.replace_range(replaced, replacement);
            self.process_edit(edited, delta)
        }

        fn process_edit(&mut self, edited: TextRange, delta: isize) -> EditOutcome {
            let mut removed_headings = Vec::new();
            let mut dirty = None;

            if delta < 0 {
                let (removed, block_span) = self.invalidate(edited, delta);
                removed_headings = removed;
                dirty = block_span;
            }

            for token in self.arena.values_mut() {
                if token.range().location >= edited.location {
                    token.shift(delta);
                }
            }
            self.folding.did_edit(edited, delta);

            let range = self.safe_parse_range(edited, dirty);
            debug!("edit {edited:?} (delta {delta}) re-parses {range:?}");
            self.reparse(range, removed_headings)
        }

        /// Remove tokens destroyed by a deletion. Returns the removed headings and the
        /// post-edit span of any paired block that lost a marker.
        fn invalidate(&mut self, edited: TextRange, delta: isize) -> (Vec<Token>, Option<TextRange>) {
            let deleted = TextRange::new(edited.upper_bound(), delta.unsigned_abs());
            let replaced = TextRange::from_bounds(edited.location, deleted.location);
            let doomed: Vec<TokenId> = self
                .all_tokens
                .iter()
                .copied()
                .filter(|id| {
                    let r = self.arena[id].range();
                    is_stale(r, deleted) || replaced.contains(r.location)
                })
                .collect();

            let old_end = deleted.upper_bound();
            let to_new = |at: usize| {
                if at >= old_end {
                    at - deleted.length
                } else {
                    at.min(edited.upper_bound())
                }
            };
            let mut dirty: Option<TextRange> = None;
            for id in &doomed {
                if let Some(span) = self.block_span(*id) {
                    let span = TextRange::from_bounds(to_new(span.location), to_new(span.upper_bound()));
                    dirty = Some(dirty.map_or(span, |d| d.union(&span)));
                }
            }

            trace!("invalidating {} token(s) around {deleted:?}", doomed.len());
            (self.drop_tokens(&doomed), dirty)
        }

        /// Whole lines around the edit, widened to touching blocks, clamped, and moved past a fold.
        fn safe_parse_range(&self, edited: TextRange, dirty: Option<TextRange>) -> TextRange {
            let start = self.line_range(edited.location).location;
            let end_line = self.line_range(edited.upper_bound());
            let mut end = end_line.upper_bound();
            if end > start && self.text.as_bytes()[end - 1] == b'\n' {
                end -= 1;
            }
            let mut range = TextRange::from_bounds(start, end.max(start));
            if let Some(dirty) = dirty {
                range = range.union(&dirty);
            }
            let spans: Vec<TextRange> = self
                .blocks
                .iter()
                .flat_map(|b| b.pairs())
                .map(|(b, e)| self.pair_span(b, e))
                .collect();
            loop {
                let widened = spans
                    .iter()
                    .filter(|span| span.touches(&range))
                    .fold(range, |acc, span| acc.union(span));
                if widened == range {
                    break;
                }
                range = widened;
            }

            let len = self.text.len();
            let start = range.location.min(len);
            let end = range.upper_bound().min(len);
            let mut range = TextRange::from_bounds(start, end);
            if let Some(folded) = self.folding.folded_range(range.location) {
                let start = folded.upper_bound().min(range.upper_bound());
                range = TextRange::from_bounds(start, range.upper_bound());
            }
            self.char_aligned(range)
        }

        fn char_aligned(&self, range: TextRange) -> TextRange {
            let mut start = range.location;
            while !self.text.is_char_boundary(start) {
                start += 1;
            }
            let mut end = range.upper_bound().max(start);
            while !self.text.is_char_boundary(end) {
                end += 1;
            }
            TextRange::from_bounds(start, end)
        }

        fn reparse(&mut self, range: TextRange, mut removed_headings: Vec<Token>) -> EditOutcome {
            let mut added_headings = Vec::new();
            if !range.is_empty() {
                let result = self.parser.parse(&self.text, Some(range));
                let mut collector = TokenCollector::new(&mut self.next_id);
                result.deliver(&self.text, &mut collector);
                let mut fresh = collector.tokens;
                fresh.sort_by_key(Token::sort_key);
                let (added, removed) = self.merge(range, fresh);
                added_headings = added;
                removed_headings.extend(removed);
            }

            if !added_headings.is_empty() || !removed_headings.is_empty() {
                debug!(
                    "headings: +{} -{}",
                    added_headings.len(),
                    removed_headings.len()
                );
                for observer in &mut self.observers {
                    observer.did_update_headings(&added_headings, &removed_headings);
                }
            }
            EditOutcome {
                parse_range: range,
                added_headings,
                removed_headings,
            }
        }

        /// Splice freshly parsed tokens into every cache. Returns added and removed headings.
        fn merge(&mut self, range: TextRange, fresh: Vec<Token>) -> (Vec<Token>, Vec<Token>) {
            let ids: Vec<TokenId> = fresh.iter().map(|t| t.id).collect();
            let heading_ids: Vec<TokenId> =
                fresh.iter().filter(|t| t.is_heading()).map(|t| t.id).collect();
            let block_ids: [Vec<TokenId>; 3] = BlockKind::ALL.map(|kind| {
                fresh
                    .iter()
                    .filter(|t| t.block_kind() == Some(kind))
                    .map(|t| t.id)
                    .collect()
            });
            let mut added: Vec<Token> = fresh.iter().filter(|t| t.is_heading()).cloned().collect();
            for token in fresh {
                self.arena.insert(token.id, token);
            }

            let dropped = merge_cache(&mut self.all_tokens, &self.arena, range, &ids);
            merge_cache(&mut self.heading_tokens, &self.arena, range, &heading_ids);
            let mut formed = Vec::new();
            for (cache, fresh) in self.blocks.iter_mut().zip(&block_ids) {
                let stale = merge_cache(&mut cache.tokens, &self.arena, range, fresh);
                if !stale.is_empty() || !fresh.is_empty() {
                    formed.extend(cache.repair(&self.arena));
                }
            }

            let mut removed = Vec::new();
            for id in &dropped {
                if let Some(token) = self.arena.swap_remove(id) {
                    if token.is_heading() {
                        removed.push(token);
                    }
                }
            }

            for token in self.suppress_block_interiors(range, &formed) {
                match added.iter().position(|t| t.id == token.id) {
                    Some(i) => {
                        added.remove(i);
                    }
                    None => removed.push(token),
                }
            }
            trace!(
                "merged {} token(s) into {range:?}, dropped {}",
                ids.len(),
                dropped.len()
            );
            (added, removed)
        }

        /// Drop non-link, non-block tokens inside paired blocks that touch `range` or were just paired.
        fn suppress_block_interiors(
            &mut self,
            range: TextRange,
            formed: &[(TokenId, TokenId)],
        ) -> Vec<Token> {
            let spans: Vec<TextRange> = self
                .blocks
                .iter()
                .flat_map(|b| b.pairs())
                .map(|(begin, end)| self.pair_span(begin, end))
                .filter(|span| span.touches(&range))
                .chain(formed.iter().map(|(b, e)| self.pair_span(*b, *e)))
                .collect();
            if spans.is_empty() {
                return Vec::new();
            }
            let doomed: Vec<TokenId> = self
                .all_tokens
                .iter()
                .copied()
                .filter(|id| {
                    let token = &self.arena[id];
                    !token.is_link()
                        && token.block_kind().is_none()
                        && spans.iter().any(|s| s.intersects(&token.range()))
                })
                .collect();
            self.drop_tokens(&doomed)
        }

        /// Remove tokens from every cache and the arena. Returns the removed headings.
        fn drop_tokens(&mut self, ids: &[TokenId]) -> Vec<Token> {
            if ids.is_empty() {
                return Vec::new();
            }
            let doomed: HashSet<TokenId> = ids.iter().copied().collect();
            self.all_tokens.retain(|id| !doomed.contains(id));
            self.heading_tokens.retain(|id| !doomed.contains(id));
            for cache in &mut self.blocks {
                let before = cache.tokens.len();
                cache.tokens.retain(|id| !doomed.contains(id));
                if cache.tokens.len() != before {
                    cache.repair(&self.arena);
                }
            }
            ids.iter()
                .filter_map(|id| self.arena.swap_remove(id))
                .filter(Token::is_heading)
                .collect()
        }

        /* ----------------------------- Blocks ----------------------------- */

        fn block_cache(&self, kind: BlockKind) -> &BlockCache {
            &self.blocks[kind.index()]
        }

        fn pair_span(&self, begin: TokenId, end: TokenId) -> TextRange {
            self.arena[&begin].range().union(&self.arena[&end].range())
        }

        /// Span of the paired block `id` belongs to, if it is a paired marker.
        fn block_span(&self, id: TokenId) -> Option<TextRange> {
            let kind = self.arena.get(&id)?.block_kind()?;
            let partner = self.block_cache(kind).partner(id)?;
            Some(self.pair_span(id, partner))
        }

        /// Begin/end marker pairs of one kind, in document order.
        pub fn paired_blocks(&self, kind: BlockKind) -> Vec<(&Token, &Token)> {
            self.block_cache(kind)
                .pairs()
                .map(|(b, e)| (&self.arena[&b], &self.arena[&e]))
                .collect()
        }

        /// Begin and end markers of one kind, paired or not.
        pub fn block_tokens(&self, kind: BlockKind) -> impl Iterator<Item = &Token> + '_ {
            self.block_cache(kind).tokens.iter().map(|id| &self.arena[id])
        }

        /// Whole block for a paired marker, the marker's own range otherwise.
        pub fn block_range(&self, id: TokenId) -> Option<TextRange> {
            let token = self.arena.get(&id)?;
            Some(self.block_span(id).unwrap_or(token.range()))
        }

        /// Text strictly between the markers of a paired block.
        pub fn block_content_range(&self, id: TokenId) -> Option<TextRange> {
            let kind = self.arena.get(&id)?.block_kind()?;
            let partner = self.block_cache(kind).partner(id)?;
            let (a, b) = (self.arena[&id].range(), self.arena[&partner].range());
            let (begin, end) = if a.location <= b.location { (a, b) } else { (b, a) };
            Some(TextRange::from_bounds(begin.upper_bound(), end.location.max(begin.upper_bound())))
        }

        /* ----------------------------- Queries ----------------------------- */

        pub fn text(&self) -> &str {
            &self.text
        }

        pub fn len(&self) -> usize {
            self.text.len()
        }

        pub fn is_empty(&self) -> bool {
            self.text.is_empty()
        }

        pub fn substring(&self, range: TextRange) -> Option<&str> {
            self.text.get(range.as_range())
        }

        /// Line containing `location`, including its trailing newline.
        pub fn line_range(&self, location: usize) -> TextRange {
            let bytes = self.text.as_bytes();
            let at = location.min(bytes.len());
            let start = bytes[..at]
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |p| p + 1);
            let end = bytes[at..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(bytes.len(), |p| at + p + 1);
            TextRange::from_bounds(start, end)
        }

        pub fn token(&self, id: TokenId) -> Option<&Token> {
            self.arena.get(&id)
        }

        /// Every token in position order.
        pub fn tokens(&self) -> impl Iterator<Item = &Token> + '_ {
            self.all_tokens.iter().map(|id| &self.arena[id])
        }

        /// Every heading in position order.
        pub fn headings(&self) -> impl Iterator<Item = &Token> + '_ {
            self.heading_tokens.iter().map(|id| &self.arena[id])
        }

        fn effective_range(&self, token: &Token) -> TextRange {
            match token.kind {
                TokenKind::BlockBegin { .. } => self.block_span(token.id).unwrap_or(token.range()),
                _ => token.range(),
            }
        }

        /// Tokens whose range contains `location` or ends exactly at it. Paired block
        /// begins count with their whole block.
        pub fn tokens_at(&self, location: usize) -> Vec<&Token> {
            // Nothing starting after `location` can contain it.
            let end = self
                .all_tokens
                .partition_point(|id| self.arena[id].range().location <= location);
            self.all_tokens[..end]
                .iter()
                .map(|id| &self.arena[id])
                .filter(|t| {
                    let r = self.effective_range(t);
                    r.contains(location) || r.upper_bound() == location
                })
                .collect()
        }

        fn heading_index(&self, id: TokenId) -> Option<usize> {
            self.heading_tokens.iter().position(|h| *h == id)
        }

        /// Last heading starting at or before `location`.
        pub fn heading_containing(&self, location: usize) -> Option<&Token> {
            if location > self.text.len() {
                return None;
            }
            self.heading_tokens
                .iter()
                .rev()
                .map(|id| &self.arena[id])
                .find(|h| h.range().location <= location)
        }

        /// Nearest preceding heading with a lower level than the one containing `location`.
        pub fn parent_heading(&self, location: usize) -> Option<&Token> {
            let heading = self.heading_containing(location)?;
            let level = heading.level()?;
            let index = self.heading_index(heading.id)?;
            self.heading_tokens[..index]
                .iter()
                .rev()
                .map(|id| &self.arena[id])
                .find(|h| h.level().is_some_and(|l| l < level))
        }

        pub fn heading_by_id(&self, identifier: &str) -> Option<&Token> {
            self.headings()
                .find(|h| h.heading().is_some_and(|d| d.identifier == identifier))
        }

        pub fn next_heading(&self, id: TokenId) -> Option<&Token> {
            let index = self.heading_index(id)?;
            self.heading_tokens.get(index + 1).map(|id| &self.arena[id])
        }

        fn end_of_run(&self, id: TokenId, stop: impl Fn(usize, usize) -> bool) -> Option<usize> {
            let index = self.heading_index(id)?;
            let level = self.arena[&id].level()?;
            let end = self.heading_tokens[index + 1..]
                .iter()
                .map(|id| &self.arena[id])
                .find(|h| h.level().is_some_and(|l| stop(l, level)))
                .map_or(self.text.len(), |h| h.range().location);
            Some(end)
        }

        /// From the heading to the next heading of the same or a higher rank.
        pub fn paragraph_range(&self, id: TokenId) -> Option<TextRange> {
            let start = self.arena.get(&id)?.range().location;
            let end = self.end_of_run(id, |l, own| l <= own)?;
            Some(TextRange::from_bounds(start, end))
        }

        /// From the heading to the next heading of any level.
        pub fn section_range(&self, id: TokenId) -> Option<TextRange> {
            let start = self.arena.get(&id)?.range().location;
            let end = self.end_of_run(id, |_, _| true)?;
            Some(TextRange::from_bounds(start, end))
        }

        /// Everything below the heading line up to the end of its last subheading.
        pub fn subheadings_range(&self, id: TokenId) -> Option<TextRange> {
            let paragraph = self.paragraph_range(id)?;
            let line_end = self.line_range(paragraph.location).upper_bound();
            Some(TextRange::from_bounds(
                line_end.min(paragraph.upper_bound()),
                paragraph.upper_bound(),
            ))
        }

        /// Headings treated as roots: each one whose level is at most the level of the last root found.
        pub fn top_level_headings(&self) -> Vec<&Token> {
            let mut roots: Vec<&Token> = Vec::new();
            for heading in self.headings() {
                let level = heading.level().unwrap_or(usize::MAX);
                match roots.last().and_then(|r| r.level()) {
                    Some(last) if level > last => {}
                    _ => roots.push(heading),
                }
            }
            roots
        }

        /// The contiguous run of deeper headings right after `id`.
        pub fn subheadings(&self, id: TokenId) -> Vec<&Token> {
            let (Some(index), Some(level)) =
                (self.heading_index(id), self.arena.get(&id).and_then(Token::level))
            else {
                return Vec::new();
            };
            self.heading_tokens[index + 1..]
                .iter()
                .map(|id| &self.arena[id])
                .take_while(|h| h.level().is_some_and(|l| l > level))
                .collect()
        }

        /// Direct children: subheadings at the level of the first subheading.
        pub fn first_level_subheadings(&self, id: TokenId) -> Vec<&Token> {
            let subs = self.subheadings(id);
            let Some(child_level) = subs.first().and_then(|h| h.level()) else {
                return Vec::new();
            };
            subs.into_iter()
                .filter(|h| h.level() == Some(child_level))
                .collect()
        }

        /// Title text of a heading: after the level marks, identifier, planning keyword and
        /// priority, before the tags.
        pub fn heading_text_range(&self, heading: &Token) -> TextRange {
            let range = heading.range();
            let mut lower = [Role::Level, Role::Planning, Role::Priority]
                .into_iter()
                .filter_map(|r| heading.role(r))
                .map(|r| r.upper_bound())
                .max()
                .unwrap_or(range.location);
            if let Some(id) = heading.role(Role::Identifier) {
                lower = lower.max(id.upper_bound() + 1);
            }
            if lower > range.location {
                lower += 1;
            }
            let upper = heading
                .role(Role::Tags)
                .map_or(range.upper_bound(), |t| t.location);
            let lower = lower.min(upper);
            let upper = upper.max(lower);
            let mut text_range = TextRange::from_bounds(lower, upper);
            if let Some(title) = self.substring(text_range) {
                let trimmed = title.trim_end().len();
                text_range = text_range.head(trimmed);
            }
            text_range
        }

        pub fn heading_tags(&self, heading: &Token) -> Vec<String> {
            heading
                .role(Role::Tags)
                .and_then(|r| self.substring(r))
                .map(|tags| {
                    tags.split(':')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        }

        pub fn planning_keyword(&self, heading: &Token) -> Option<&str> {
            heading.role(Role::Planning).and_then(|r| self.substring(r))
        }

        /// Whether the heading carries one of the finished planning keywords.
        pub fn is_finished(&self, heading: &Token) -> bool {
            self.planning_keyword(heading)
                .is_some_and(|k| self.settings.is_finished(k))
        }

        /// Key/value lines of the first paired `PROPERTIES` drawer in the section of the
        /// heading containing `location`.
        pub fn property_content_for_heading(
            &self,
            location: usize,
        ) -> Option<IndexMap<String, String>> {
            let heading = self.heading_containing(location)?;
            let section = self.section_range(heading.id)?;
            let (begin, _) = self
                .paired_blocks(BlockKind::Drawer)
                .into_iter()
                .filter(|(b, _)| section.contains(b.range().location))
                .find(|(b, _)| {
                    b.role(Role::DrawerName).and_then(|r| self.substring(r))
                        == Some(grammar::values::PROPERTIES)
                })?;
            let content = self.substring(self.block_content_range(begin.id)?)?;
            Some(
                content
                    .lines()
                    .filter_map(|line| grammar::PROPERTY_LINE.captures(line))
                    .map(|c| (c[1].to_string(), c[2].to_string()))
                    .collect(),
            )
        }
    }

    /* --------------------------- Token building --------------------------- */

    /// Turns parse callbacks into tokens, applying the ignore ranges to inline marks.
    struct TokenCollector<'a> {
        next_id: &'a mut u64,
        tokens: Vec<Token>,
        ignore: IgnoreRanges,
    }

    impl<'a> TokenCollector<'a> {
        fn new(next_id: &'a mut u64) -> Self {
            Self {
                next_id,
                tokens: Vec::new(),
                ignore: IgnoreRanges::default(),
            }
        }

        fn push(&mut self, kind: TokenKind, record: &MatchRecord) {
            *self.next_id += 1;
            self.tokens.push(Token::new(
                TokenId(*self.next_id),
                kind,
                record.range,
                record.roles.clone(),
            ));
        }

        fn push_all(&mut self, matches: &[MatchRecord], kind: TokenKind) {
            for record in matches {
                self.push(kind.clone(), record);
            }
        }
    }

    impl ParserDelegate for TokenCollector<'_> {
        fn did_start_parsing(&mut self, _text: &str) {
            self.tokens.clear();
            self.ignore.clear();
        }

        fn did_find_headings(&mut self, text: &str, matches: &[MatchRecord]) {
            for record in matches {
                let level = record.role(Role::Level).unwrap_or_default();
                self.ignore.push(level);
                let identifier = record
                    .role(Role::Identifier)
                    .and_then(|r| text.get(r.as_range()))
                    .filter(|id| !id.is_empty())
                    .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
                let data = HeadingData {
                    level: level.length,
                    identifier,
                };
                self.push(TokenKind::Heading(data), record);
            }
        }

        fn did_find_checkboxes(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::Checkbox);
        }

        fn did_find_code_block_begins(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockBegin { block: BlockKind::SourceCode });
        }

        fn did_find_code_block_ends(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockEnd { block: BlockKind::SourceCode });
        }

        fn did_find_quote_block_begins(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockBegin { block: BlockKind::Quote });
        }

        fn did_find_quote_block_ends(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockEnd { block: BlockKind::Quote });
        }

        fn did_find_drawer_begins(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockBegin { block: BlockKind::Drawer });
        }

        fn did_find_drawer_ends(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::BlockEnd { block: BlockKind::Drawer });
        }

        fn did_find_ordered_lists(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::OrderedListItem);
        }

        fn did_find_unordered_lists(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::UnorderedListItem);
        }

        fn did_find_separators(&mut self, _text: &str, matches: &[MatchRecord]) {
            self.push_all(matches, TokenKind::Separator);
        }

        fn did_find_attachments(&mut self, _text: &str, matches: &[MatchRecord]) {
            for record in matches {
                self.ignore.push(record.range);
                self.push(TokenKind::Attachment, record);
            }
        }

        fn did_find_links(&mut self, _text: &str, matches: &[MatchRecord]) {
            for record in matches {
                self.ignore.push(record.range);
                self.push(TokenKind::Link, record);
            }
        }

        fn did_find_raw_http_links(&mut self, _text: &str, matches: &[MatchRecord]) {
            for record in matches {
                self.ignore.push(record.range);
                self.push(TokenKind::Link, record);
            }
        }

        fn did_find_date_and_times(&mut self, text: &str, matches: &[MatchRecord]) {
            for record in matches {
                let value = text.get(record.range.as_range()).and_then(DateAndTime::parse);
                self.push(TokenKind::DateAndTime { value }, record);
            }
        }

        fn did_find_text_marks(&mut self, _text: &str, matches: &[MatchRecord]) {
            for record in matches {
                let Some(mark) = record.mark else { continue };
                if self.ignore.covers(&record.range) {
                    continue;
                }
                self.push(TokenKind::TextMark { mark }, record);
            }
        }
    }

}

pub use crate::core::{OutlineError, TextRange, Token, TokenId, TokenKind};
pub use crate::date::{DateAndTime, Notice, RepeatMode};
pub use crate::grammar::ParseeTypes;
pub use crate::parser::{OutlineParser, ParserDelegate};
pub use crate::settings::OutlineSettings;
pub use crate::storage::{EditOutcome, OutlineStorage};
