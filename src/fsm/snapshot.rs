//! Snapshot handles and the snapshot image codec
//!
//! A snapshot image is a JSON array of `SET`-shaped [`CommandPayload`]
//! records covering the whole key space:
//!
//! ```text
//! [
//! {"operation":"SET","key":"alice","value":"c2VjcmV0..."},
//! {"operation":"SET","key":"bob","value":{"nested":true}}
//! ]
//! ```
//!
//! Images are decoded as a stream, one record at a time, into a staged
//! storage batch. Keys are taken exactly as written, the same way the state
//! machine applies them.

use crate::common::Result;
use crate::fsm::command::CommandPayload;
use crate::fsm::storage::{encode_value, Storage};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};

/// A point-in-time snapshot handed to the consensus engine for compaction.
pub trait FsmSnapshot: Send {
    /// Write the snapshot to `sink`.
    fn persist(&self, sink: &mut dyn Write) -> Result<()>;

    /// Called once the engine is done with the snapshot.
    fn release(&mut self);
}

/// Snapshot that persists nothing.
///
/// All applied state already lives in the sled database, which survives log
/// truncation on its own, so compaction needs no separate blob.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshot;

impl FsmSnapshot for NoopSnapshot {
    fn persist(&self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) {}
}

/// Records decoded from an image, staged but not yet written.
#[derive(Default)]
pub struct StagedImage {
    batch: sled::Batch,
    keys: HashSet<String>,
    records: usize,
}

impl StagedImage {
    /// Number of records read from the image
    pub fn records(&self) -> usize {
        self.records
    }

    /// Batch that adds every record on top of the current contents.
    pub fn merging(self) -> sled::Batch {
        self.batch
    }

    /// Batch that makes `storage` hold exactly the image: every stored key
    /// missing from the image is removed in the same batch.
    pub fn replacing(mut self, storage: &Storage) -> Result<sled::Batch> {
        for key in storage.keys() {
            let key = key?;
            if !self.keys.contains(&key) {
                self.batch.remove(key.as_bytes());
            }
        }
        Ok(self.batch)
    }
}

/// Decode a whole image from `reader` without touching storage.
///
/// A stream holding only whitespace is an empty image.
pub fn read_image<R: Read>(reader: R) -> Result<StagedImage> {
    let mut staged = StagedImage::default();
    let mut reader = BufReader::new(reader);
    if at_end(&mut reader)? {
        return Ok(staged);
    }

    let mut de = serde_json::Deserializer::from_reader(reader);
    (&mut de).deserialize_seq(ImageVisitor {
        staged: &mut staged,
    })?;
    de.end()?;
    Ok(staged)
}

/// Write every record in `storage` as an image. Returns the record count.
pub fn write_image<W: Write>(storage: &Storage, mut writer: W) -> Result<usize> {
    let mut count = 0;
    writer.write_all(b"[")?;
    for record in storage.scan() {
        let (key, value) = record?;
        if count > 0 {
            writer.write_all(b",")?;
        }
        writer.write_all(b"\n")?;
        serde_json::to_writer(&mut writer, &CommandPayload::set(key, value))?;
        count += 1;
    }
    writer.write_all(b"\n]\n")?;
    writer.flush()?;
    Ok(count)
}

fn at_end<R: BufRead>(reader: &mut R) -> io::Result<bool> {
    loop {
        let (skipped, available) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(true);
            }
            let skipped = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            (skipped, buf.len())
        };
        reader.consume(skipped);
        if skipped < available {
            return Ok(false);
        }
    }
}

struct ImageVisitor<'a> {
    staged: &'a mut StagedImage,
}

impl<'de, 'a> Visitor<'de> for ImageVisitor<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON array of command records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        let staged = self.staged;
        while let Some(record) = seq.next_element::<CommandPayload>()? {
            let n = staged.records;
            if record.key.trim().is_empty() {
                return Err(de::Error::custom(format!("record {}: key is empty", n)));
            }
            let encoded = encode_value(record.value.as_ref())
                .map_err(|e| de::Error::custom(format!("record {}: {}", n, e)))?;
            if let Some(bytes) = encoded {
                staged.batch.insert(record.key.as_bytes(), bytes);
                staged.keys.insert(record.key);
            }
            staged.records += 1;
        }
        Ok(())
    }
}
