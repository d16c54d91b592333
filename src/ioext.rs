use std::io::{
	Write, Read,
	Seek, SeekFrom,
};

use crate::error::SectorKvError;

/// For types that can be written to a writer.
pub trait Writable {
	fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, SectorKvError>;
}

/// For types that can be read from a reader.
pub trait Readable: Sized {
	fn read_from<R: Read>(reader: &mut R) -> Result<Self, SectorKvError>;
}

/// For types that represent a seekable file offset.
pub trait Seekable: Sized {
	fn seek_to<S: Seek>(&self, seeker: &mut S) -> Result<u64, SectorKvError> {
		Ok(seeker.seek(self.seeker())?)
	}

	fn seeker(&self) -> SeekFrom;
}

pub trait WriteExt: Write + Sized {
	fn write_value<T: Writable>(&mut self, value: T) -> Result<usize, SectorKvError>;
}

pub trait ReadExt: Read + Sized {
	fn read_value<T: Readable>(&mut self) -> Result<T, SectorKvError>;
}

impl<W: Write + Sized> WriteExt for W {
	fn write_value<T: Writable>(&mut self, value: T) -> Result<usize, SectorKvError> {
		value.write_to(self)
	}
}

impl<R: Read + Sized> ReadExt for R {
	fn read_value<T: Readable>(&mut self) -> Result<T, SectorKvError> {
		T::read_from(self)
	}
}

pub trait SeekExt: Seek + Sized {
	fn seek_to<S: Seekable>(&mut self, seek_offset: &S) -> Result<u64, SectorKvError>;

	fn seek_return(&mut self) -> Result<SeekFrom, SectorKvError>;
}

impl<T: Seek + Sized> SeekExt for T {
	fn seek_to<S: Seekable>(&mut self, seek_offset: &S) -> Result<u64, SectorKvError> {
		seek_offset.seek_to(self)
	}

	fn seek_return(&mut self) -> Result<SeekFrom, SectorKvError> {
		Ok(SeekFrom::Start(self.stream_position()?))
	}
}

pub trait WriteZeroes {
	fn write_zeroes(&mut self, count: u64) -> std::io::Result<u64>;
}

impl<T: Write> WriteZeroes for T {
	fn write_zeroes(&mut self, count: u64) -> std::io::Result<u64> {
		const ZEROES: &[u8; 4096] = &[0u8; 4096];
		let mut remainder = count;
		while remainder >= ZEROES.len() as u64 {
			self.write_all(ZEROES)?;
			remainder -= ZEROES.len() as u64;
		}
		if remainder != 0 {
			self.write_all(&ZEROES[0..remainder as usize])?;
		}
		Ok(count)
	}
}
