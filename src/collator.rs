//! Folds a lazy stream of tokens (or function-call fragments) into
//! sentence-sized chunks, the way a streaming LLM's output must be chunked
//! before being handed to a text-to-speech engine.

use async_stream::stream;
use futures_core::Stream;
use tokio_stream::StreamExt;

const SENTENCE_ENDINGS: [char; 4] = ['.', '!', '?', '\n'];

/// One item of the input stream: either a text token, or a fragment of a
/// function call being streamed in pieces.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// A text token.
    Token(String),
    /// A fragment of a function call. Name and arguments may each arrive
    /// over several fragments; fragments are concatenated as they arrive.
    FunctionFragment {
        /// Fragment of the function name, if this piece carries one.
        name: Option<String>,
        /// Fragment of the serialized arguments, if this piece carries one.
        arguments: Option<String>,
    },
}

/// One item of the collated output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollatedItem {
    /// A complete, trimmed sentence.
    Sentence(String),
    /// The function call aggregated from every `FunctionFragment`, emitted
    /// once the input ends, if both a name and arguments were seen and the
    /// caller asked for it.
    FunctionCall {
        /// Aggregated function name.
        name: String,
        /// Aggregated serialized arguments.
        arguments: String,
    },
}

/// Returns the position of the rightmost sentence-ending character in
/// `buffer`, or `None` if none is present. There is no sentinel index for
/// "absent" — callers must match on the `Option`.
pub fn find_last_punctuation(buffer: &str) -> Option<usize> {
    buffer
        .char_indices()
        .rev()
        .find(|(_, c)| SENTENCE_ENDINGS.contains(c))
        .map(|(i, _)| i)
}

/// Whether `buffer` currently looks like the start of a numbered list item:
/// one or more digits immediately followed by a space or a period.
fn is_list_item_prefix(buffer: &str) -> bool {
    let mut digit_end = 0;
    for (i, c) in buffer.char_indices() {
        if c.is_ascii_digit() {
            digit_end = i + c.len_utf8();
        } else {
            break;
        }
    }
    if digit_end == 0 {
        return false;
    }
    matches!(buffer[digit_end..].chars().next(), Some(' ') | Some('.'))
}

/// Whether `buffer` ends with a monetary pattern `\$\d+.$` — a dollar sign,
/// one or more digits, then exactly one more character of any kind (the
/// decimal point of an in-progress amount, most commonly).
fn ends_with_monetary_pattern(buffer: &str) -> bool {
    let chars: Vec<char> = buffer.chars().collect();
    if chars.len() < 3 {
        return false;
    }
    let mut j = chars.len() - 1; // the trailing "any" character
    let mut digits = 0;
    while j > 0 && chars[j - 1].is_ascii_digit() {
        digits += 1;
        j -= 1;
    }
    digits > 0 && j > 0 && chars[j - 1] == '$'
}

fn flush(buffer: &mut String) -> Option<String> {
    let trimmed = buffer.trim().to_owned();
    buffer.clear();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

/// Collate a token stream into sentence-sized chunks.
///
/// `want_function_call` controls whether an aggregated `FunctionCall` is
/// emitted at the end when fragments accumulated a name and arguments; if
/// `false`, function fragments are still consumed (so they don't pollute the
/// sentence buffer) but never yielded.
pub fn collate(
    mut input: impl Stream<Item = StreamItem> + Unpin + Send + 'static,
    want_function_call: bool,
) -> impl Stream<Item = CollatedItem> + Send + 'static {
    stream! {
        let mut buffer = String::new();
        let mut money_suppressed = false;
        let mut fn_name: Option<String> = None;
        let mut fn_arguments: Option<String> = None;

        while let Some(item) = input.next().await {
            match item {
                StreamItem::Token(token) => {
                    if money_suppressed && token.starts_with(' ')
                        && let Some(sentence) = flush(&mut buffer)
                    {
                        yield CollatedItem::Sentence(sentence);
                    }
                    money_suppressed = false;

                    buffer.push_str(&token);

                    if ends_with_monetary_pattern(&buffer) {
                        money_suppressed = true;
                        continue;
                    }

                    let is_list = is_list_item_prefix(&buffer);
                    let boundary = match token.chars().last() {
                        Some(c) if is_list => c == '\n',
                        Some(c) => SENTENCE_ENDINGS.contains(&c),
                        None => false,
                    };
                    if boundary
                        && let Some(sentence) = flush(&mut buffer)
                    {
                        yield CollatedItem::Sentence(sentence);
                    }
                }
                StreamItem::FunctionFragment { name, arguments } => {
                    if let Some(name) = name {
                        fn_name.get_or_insert_with(String::new).push_str(&name);
                    }
                    if let Some(arguments) = arguments {
                        fn_arguments.get_or_insert_with(String::new).push_str(&arguments);
                    }
                }
            }
        }

        if let Some(sentence) = flush(&mut buffer) {
            yield CollatedItem::Sentence(sentence);
        }

        if want_function_call
            && let (Some(name), Some(arguments)) = (fn_name, fn_arguments)
        {
            yield CollatedItem::FunctionCall { name, arguments };
        }
    }
}

/// Collect every token in `tokens` through [`collate`] and return the
/// resulting items. Convenience for tests and for callers that don't need
/// the stream to stay lazy.
pub async fn collate_all(tokens: Vec<StreamItem>, want_function_call: bool) -> Vec<CollatedItem> {
    let input = tokio_stream::iter(tokens);
    let output = collate(input, want_function_call);
    tokio::pin!(output);
    let mut items = Vec::new();
    while let Some(item) = output.next().await {
        items.push(item);
    }
    items
}
