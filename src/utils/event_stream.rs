//! 上游流式响应解码器
//!
//! `EventStreamData` 解析 `text/event-stream`，`JsonLinesData` 解析按行分隔的 JSON。
//! 两者都实现 `tokio_util::codec::Decoder`，配合 `FramedRead` + `StreamReader` 使用。

use std::io;

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::Decoder;

/// SSE 流结束标记
pub const DONE_SENTINEL: &str = "[DONE]";

/// 一个完整的 SSE 事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStream {
    pub event: Option<String>,
    pub id: Option<String>,
    /// 多行 `data:` 以换行拼接后的原始文本
    pub data: String,
    pub retry: Option<u64>,
}

impl EventStream {
    /// 是否为 `[DONE]` 结束标记
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }

    /// 从第一个 `{` 开始按 JSON 解析，失败返回 `None`
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        let payload = self.data.trim();
        let pos = payload.find('{')?;
        serde_json::from_str(&payload[pos..]).ok()
    }
}

/// SSE 解码器
#[derive(Debug, Clone, Default)]
pub struct EventStreamData {
    current: EventStream,
    has_any: bool,
    has_data: bool,
}

impl EventStreamData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take_event(&mut self) -> Option<EventStream> {
        if !self.has_any {
            return None;
        }
        self.has_any = false;
        self.has_data = false;
        Some(std::mem::take(&mut self.current))
    }

    fn process_line(&mut self, line: &str) -> Option<EventStream> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
                self.has_any = true;
            }
            "event" => {
                self.current.event = Some(value.to_string());
                self.has_any = true;
            }
            "id" => {
                self.current.id = Some(value.to_string());
                self.has_any = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.current.retry = Some(ms);
                }
                self.has_any = true;
            }
            _ => {}
        }
        None
    }
}

impl Decoder for EventStreamData {
    type Item = EventStream;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = take_one_line(src)? {
            if let Some(ev) = self.process_line(&line) {
                return Ok(Some(ev));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(ev) = self.decode(src)? {
            return Ok(Some(ev));
        }
        // 末尾没有换行的残行
        if !src.is_empty() {
            let last = take_rest(src)?;
            if let Some(ev) = self.process_line(&last) {
                return Ok(Some(ev));
            }
        }
        Ok(self.take_event())
    }
}

/// JSON-lines 解码器；空行和无法解析的行会被跳过
#[derive(Debug, Clone, Default)]
pub struct JsonLinesData;

impl JsonLinesData {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn parse(line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, "跳过无法解析的 JSON 行");
                None
            }
        }
    }
}

impl Decoder for JsonLinesData {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = take_one_line(src)? {
            if let Some(value) = Self::parse(&line) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let last = take_rest(src)?;
        Ok(Self::parse(&last))
    }
}

fn take_one_line(src: &mut BytesMut) -> io::Result<Option<String>> {
    let Some(pos) = src.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let mut line_bytes = src.split_to(pos + 1);
    line_bytes.truncate(line_bytes.len() - 1);
    if line_bytes.ends_with(b"\r") {
        line_bytes.truncate(line_bytes.len() - 1);
    }
    // 非法 UTF-8 按替换字符处理，单行损坏不中断整条流
    Ok(Some(String::from_utf8_lossy(&line_bytes).into_owned()))
}

fn take_rest(src: &mut BytesMut) -> io::Result<String> {
    let mut last = String::from_utf8_lossy(&src.split_to(src.len())).into_owned();
    if last.ends_with('\r') {
        last.pop();
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn decode_all<D>(decoder: D, input: &str) -> Vec<D::Item>
    where
        D: Decoder<Error = io::Error>,
    {
        let mut codec = decoder;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        while let Some(item) = codec.decode_eof(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let events = decode_all(
            EventStreamData::new(),
            "event: message\ndata: {\"a\":\ndata: 1}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"a\":\n1}");
        assert_eq!(events[0].json().unwrap()["a"], 1);
    }

    #[test]
    fn test_crlf_comments_and_done() {
        let events = decode_all(
            EventStreamData::new(),
            ": keep-alive\r\ndata: first\r\n\r\ndata: [DONE]\r\n\r\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_partial_final_line_is_flushed() {
        let events = decode_all(EventStreamData::new(), "data: a\n\ndata: tail");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "tail");
    }

    #[test]
    fn test_json_lines_skip_garbage() {
        let values = decode_all(JsonLinesData::new(), "{\"n\":1}\n\nnot json\n{\"n\":2}");
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["n"], 2);
    }

    #[tokio::test]
    async fn test_chunked_input_through_framed_read() {
        let chunks: Vec<io::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"data: hel")),
            Ok(bytes::Bytes::from_static(b"lo\n")),
            Ok(bytes::Bytes::from_static(b"\ndata: x\n\n")),
        ];
        let reader = tokio_util::io::StreamReader::new(futures::stream::iter(chunks));
        let events: Vec<_> = FramedRead::new(reader, EventStreamData::new())
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
    }
}
