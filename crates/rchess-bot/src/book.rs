//! Polyglot opening book lookup.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use shakmaty::EnPassantMode;
use shakmaty::zobrist::{Zobrist64, ZobristHash};

use crate::board::BoardState;
use crate::error::BookError;

const ENTRY_SIZE: u64 = 16;
const PROMOTION_PIECES: [Option<char>; 5] = [None, Some('n'), Some('b'), Some('r'), Some('q')];

/// One candidate move from the book, in UCI notation as stored (castling is
/// king-takes-rook).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub uci: String,
    pub weight: u16,
}

pub trait OpeningBook: Send + Sync {
    /// All entries for the position, in book order.
    fn lookup(&self, board: &BoardState) -> Result<Vec<BookEntry>, BookError>;
}

/// Polyglot key of the position.
pub fn polyglot_key(board: &BoardState) -> u64 {
    let hash: Zobrist64 = board.position().zobrist_hash(EnPassantMode::Legal);
    hash.0
}

/// A Polyglot `.bin` book: 16-byte big-endian records sorted by key.
///
/// The file is reopened per lookup, so replacing it on disk takes effect for
/// the next move without a restart.
pub struct PolyglotBook {
    path: PathBuf,
}

impl PolyglotBook {
    pub fn open(path: &Path) -> Result<Self, BookError> {
        let len = std::fs::metadata(path)?.len();
        if len % ENTRY_SIZE != 0 {
            return Err(BookError::Corrupt(format!(
                "{} has {len} bytes, not a multiple of {ENTRY_SIZE}",
                path.display()
            )));
        }
        log::info!("book: {} ({} entries)", path.display(), len / ENTRY_SIZE);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_key<R: Read + Seek>(reader: &mut R, index: u64) -> Result<u64, BookError> {
        reader.seek(SeekFrom::Start(index * ENTRY_SIZE))?;
        Ok(reader.read_u64::<BigEndian>()?)
    }
}

impl OpeningBook for PolyglotBook {
    fn lookup(&self, board: &BoardState) -> Result<Vec<BookEntry>, BookError> {
        let key = polyglot_key(board);
        let file = File::open(&self.path)?;
        let count = file.metadata()?.len() / ENTRY_SIZE;
        let mut reader = BufReader::new(file);

        // Lower bound of `key`.
        let (mut lo, mut hi) = (0u64, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if Self::read_key(&mut reader, mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut entries = Vec::new();
        reader.seek(SeekFrom::Start(lo * ENTRY_SIZE))?;
        for _ in lo..count {
            let entry_key = reader.read_u64::<BigEndian>()?;
            let raw_move = reader.read_u16::<BigEndian>()?;
            let weight = reader.read_u16::<BigEndian>()?;
            let _learn = reader.read_u32::<BigEndian>()?;
            if entry_key != key {
                break;
            }
            match decode_move(raw_move) {
                Some(uci) => entries.push(BookEntry { uci, weight }),
                None => log::debug!("book: skipping undecodable move {raw_move:#06x}"),
            }
        }
        Ok(entries)
    }
}

/// Decodes a Polyglot move (`to` in bits 0-5, `from` in bits 6-11, promotion
/// piece in bits 12-14) into a UCI string.
pub fn decode_move(raw: u16) -> Option<String> {
    let square = |bits: u16| {
        let file = (b'a' + (bits & 7) as u8) as char;
        let rank = (b'1' + ((bits >> 3) & 7) as u8) as char;
        format!("{file}{rank}")
    };
    let to = square(raw & 0x3f);
    let from = square((raw >> 6) & 0x3f);
    if from == to {
        return None;
    }
    let promotion = *PROMOTION_PIECES.get(((raw >> 12) & 7) as usize)?;
    let mut uci = from + &to;
    if let Some(piece) = promotion {
        uci.push(piece);
    }
    Some(uci)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    const START_KEY: u64 = 0x463b_9618_1691_fc9c;

    fn encode(uci: &str) -> u16 {
        let sq = |s: &[u8]| u16::from(s[0] - b'a') | (u16::from(s[1] - b'1') << 3);
        let bytes = uci.as_bytes();
        let mut raw = sq(&bytes[2..4]) | (sq(&bytes[0..2]) << 6);
        if let Some(&p) = bytes.get(4) {
            let idx = PROMOTION_PIECES.iter().position(|c| *c == Some(p as char)).unwrap();
            raw |= (idx as u16) << 12;
        }
        raw
    }

    fn write_book(records: &[(u64, &str, u16)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for &(key, uci, weight) in records {
            file.write_u64::<BigEndian>(key).unwrap();
            file.write_u16::<BigEndian>(encode(uci)).unwrap();
            file.write_u16::<BigEndian>(weight).unwrap();
            file.write_u32::<BigEndian>(0).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn start_position_key_matches_polyglot() {
        assert_eq!(polyglot_key(&BoardState::new()), START_KEY);
    }

    #[test]
    fn decodes_promotions_and_castling() {
        assert_eq!(decode_move(encode("e2e4")).as_deref(), Some("e2e4"));
        assert_eq!(decode_move(encode("a7a8q")).as_deref(), Some("a7a8q"));
        assert_eq!(decode_move(encode("e1h1")).as_deref(), Some("e1h1"));
        assert_eq!(decode_move(0), None);
    }

    #[test]
    fn lookup_returns_entries_for_the_position_only() {
        let file = write_book(&[
            (1, "a2a3", 1),
            (START_KEY, "e2e4", 5),
            (START_KEY, "d2d4", 9),
            (START_KEY, "g1f3", 9),
            (u64::MAX, "h2h3", 1),
        ]);
        let book = PolyglotBook::open(file.path()).unwrap();
        let entries = book.lookup(&BoardState::new()).unwrap();
        let ucis: Vec<&str> = entries.iter().map(|e| e.uci.as_str()).collect();
        assert_eq!(ucis, vec!["e2e4", "d2d4", "g1f3"]);

        let mut board = BoardState::new();
        board.sync("e2e4").unwrap();
        assert!(book.lookup(&board).unwrap().is_empty());
    }

    #[test]
    fn rejects_truncated_book() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 10]).unwrap();
        assert!(matches!(
            PolyglotBook::open(file.path()),
            Err(BookError::Corrupt(_))
        ));
    }
}
