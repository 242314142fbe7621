//! Bolero fuzzer for the chunk codec against a real channel buffer.
//!
//! Properties tested:
//! - Chunks reassemble to the original message
//! - Every chunk but the last fills the buffer
//! - Exactly one chunk is final, and it is the last
//! - An empty message is a single empty final chunk

use bolero::check;
use shmcall::codec::{decode_chunk, ChunkWriter};
use shmcall::Channel;

fn main() {
    check!()
        .with_type::<(u8, String)>()
        .for_each(|(capacity, message)| {
            let capacity = usize::from(*capacity % 16) + 1;
            let channel = Channel::with_capacity(capacity).expect("valid capacity");
            let mut writer = ChunkWriter::new(message);
            let units = message.chars().count();
            let mut reassembled = String::new();
            let mut chunks = Vec::new();

            while let Some(chunk) = writer.next_chunk(&channel) {
                let fragment = decode_chunk(&channel, chunk.len).expect("chunk decodes");
                reassembled.push_str(&fragment);
                chunks.push(chunk);
            }

            assert_eq!(&reassembled, message);
            assert_eq!(chunks.len(), units.div_ceil(capacity).max(1));

            let (last, rest) = chunks.split_last().expect("at least one chunk");
            assert!(last.is_final);
            assert!(last.len <= capacity);
            for chunk in rest {
                assert!(!chunk.is_final);
                assert_eq!(chunk.len, capacity);
            }
            assert!(writer.is_finished());
        });
}
