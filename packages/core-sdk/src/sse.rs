use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::llm::{CompletionStream, StreamEvent};

/**
 * \brief 一个完整的 SSE 事件块。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    /** \brief 多行 `data:` 以换行拼接 */
    pub data: String,
}

/**
 * \brief 增量解码器：网络分片可以在任意字节处切断事件块。
 * \details `\r\n` 与单独的 `\r` 均按换行处理，`\r\n` 可跨分片。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    pending_cr: bool,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if std::mem::take(&mut self.pending_cr) && b == b'\n' {
                continue;
            }
            if b == b'\r' {
                self.buf.push(b'\n');
                self.pending_cr = true;
            } else {
                self.buf.push(b);
            }
        }
    }

    /**
     * \brief 取出下一个完整事件；仅含注释的块被跳过。
     */
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let pos = find_double_newline(&self.buf)?;
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(frame) = parse_block(&block) {
                return Some(frame);
            }
        }
    }

    /**
     * \brief 流结束时冲刷未以空行结尾的残留块。
     */
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.pending_cr = false;
        let block = std::mem::take(&mut self.buf);
        parse_block(&block)
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(block);
    let mut event = None;
    let mut data = Vec::new();
    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

/**
 * \brief 把 SSE 响应体转为事件流。
 * \details 遇到终止事件即结束。上游在终止事件之前断开时流直接结束，由调用方按未完成处理；
 * 取消令牌触发后同样直接结束，响应体随之释放，连接断开。
 */
pub(crate) fn relay<F>(
    response: reqwest::Response,
    cancel: CancellationToken,
    interpret: F,
) -> CompletionStream
where
    F: Fn(&SseFrame) -> Vec<StreamEvent> + Send + 'static,
{
    let mut body = Box::pin(response.bytes_stream());
    let out = async_stream::stream! {
        let mut decoder = SseDecoder::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };
            let Some(chunk) = next else {
                return;
            };
            let mut frames = Vec::new();
            let eof = chunk.is_none();
            match chunk {
                Some(Ok(bytes)) => {
                    decoder.push(&bytes);
                    while let Some(frame) = decoder.next_frame() {
                        frames.push(frame);
                    }
                }
                Some(Err(e)) => {
                    yield StreamEvent::Error(format!("stream interrupted: {}", e));
                    return;
                }
                None => frames.extend(decoder.finish()),
            }
            for frame in &frames {
                for event in interpret(frame) {
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
            }
            if eof {
                return;
            }
        }
    };
    Box::pin(out)
}
