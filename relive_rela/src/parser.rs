use byteorder::ByteOrder;
use std::marker::PhantomData;
use thiserror::Error;

/// Size of one `Elf64_Rela` entry.
pub const RELA_ENTRY_SIZE: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpectedly hit end of input data while reading {0} bytes")]
    UnexpectedEof(usize),
    #[error("relocation table of {len} bytes is not a whole number of entries")]
    TrailingBytes { len: usize },
    #[error("symbol index {0} is out of bounds of the symbol table")]
    SymbolIndexOutOfRange(u32),
    #[error("symbol {0} is not marked as a livepatch symbol")]
    NotLivepatchSymbol(String),
    #[error("symbol {0} has an incorrectly formatted name")]
    BadSymbolName(String),
    #[error("section {0} has an incorrectly formatted name")]
    BadSectionName(String),
}

type Result<T> = std::result::Result<T, ParseError>;

/// One decoded `Elf64_Rela`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub sym: u32,
    pub kind: u32,
    pub addend: i64,
}

pub struct Parser<'a, BO: ByteOrder> {
    data: &'a [u8],
    pos: usize,
    _phantom: PhantomData<BO>,
}

impl<'a, BO: ByteOrder + 'a> Parser<'a, BO> {
    pub fn parse(data: &'a [u8]) -> Result<Vec<Rela>> {
        if data.len() % RELA_ENTRY_SIZE != 0 {
            return Err(ParseError::TrailingBytes { len: data.len() });
        }

        let mut parser = Parser {
            data,
            pos: 0,
            _phantom: PhantomData::<BO>,
        };

        let mut relas = Vec::with_capacity(data.len() / RELA_ENTRY_SIZE);
        while parser.pos < parser.data.len() {
            relas.push(parser.parse_rela()?);
        }
        Ok(relas)
    }

    fn parse_rela(&mut self) -> Result<Rela> {
        let offset = self.read_u64()?;
        let info = self.read_u64()?;
        let addend = self.read_i64()?;

        Ok(Rela {
            offset,
            sym: (info >> 32) as u32,
            kind: (info & 0xffff_ffff) as u32,
            addend,
        })
    }

    fn read_n(&mut self, n: usize) -> Result<&[u8]> {
        let (new_pos, over) = self.pos.overflowing_add(n);
        if over || new_pos > self.data.len() {
            return Err(ParseError::UnexpectedEof(n));
        }
        let res = &self.data[self.pos..new_pos];
        self.pos = new_pos;
        Ok(res)
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(BO::read_u64(self.read_n(8)?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(BO::read_i64(self.read_n(8)?))
    }
}
