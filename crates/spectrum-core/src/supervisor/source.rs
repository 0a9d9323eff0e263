// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte sources a session reads backend output from.

use std::io::{self, PipeReader, Read};

use log::debug;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;

/// Number of chunks the pipe reader thread may run ahead of the session.
const PIPE_QUEUE_DEPTH: usize = 16;

/// Where the decoder's bytes come from.
pub(super) enum OutputSource {
    /// The child's stdout.
    Stdout { stdout: ChildStdout, buf: Vec<u8> },
    /// A dedicated OS pipe drained by a reader thread.
    Pipe(mpsc::Receiver<io::Result<Vec<u8>>>),
}

impl std::fmt::Debug for OutputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout { .. } => f.write_str("OutputSource::Stdout"),
            Self::Pipe(_) => f.write_str("OutputSource::Pipe"),
        }
    }
}

impl OutputSource {
    pub(super) fn stdout(stdout: ChildStdout, chunk_size: usize) -> Self {
        Self::Stdout {
            stdout,
            buf: vec![0; chunk_size.max(1)],
        }
    }

    /// Drain `reader` on its own thread.
    ///
    /// The thread exits at end of stream, on a read error, or once the
    /// session drops this source.
    pub(super) fn pipe(mut reader: PipeReader, chunk_size: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel(PIPE_QUEUE_DEPTH);
        let chunk_size = chunk_size.max(1);

        std::thread::Builder::new()
            .name("spectrum-pipe-reader".to_string())
            .spawn(move || {
                let mut buf = vec![0; chunk_size];
                loop {
                    let result = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => Ok(buf[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => Err(e),
                    };
                    let failed = result.is_err();
                    if tx.blocking_send(result).is_err() || failed {
                        break;
                    }
                }
                debug!("Pipe reader finished");
            })?;

        Ok(Self::Pipe(rx))
    }

    /// Next chunk of output, or `None` at end of stream.
    pub(super) async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Stdout { stdout, buf } => {
                let n = stdout.read(buf).await?;
                Ok((n > 0).then(|| buf[..n].to_vec()))
            }
            Self::Pipe(rx) => rx.recv().await.transpose(),
        }
    }
}
