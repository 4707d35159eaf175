use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use lablens_common::{LabLensError, PipelineError, Result};
use memmap2::Mmap;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::path::Path;

/// Read every record batch of a parquet file.
pub fn read_parquet_batches(path: &Path, batch_size: usize) -> Result<Vec<RecordBatch>> {
    let file = std::fs::File::open(path)?;
    // memory-map the file, then hand the reader an owned buffer
    let mmap: Mmap = unsafe { Mmap::map(&file)? };
    let bytes = Bytes::copy_from_slice(&mmap);
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?
        .with_batch_size(batch_size.max(1))
        .build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Write `batch` to `path` so that readers see either the old file or the complete new one.
pub fn write_parquet_atomic(path: &Path, batch: &RecordBatch) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    // temp file in the target dir so the final rename stays on one filesystem
    let tmp = tempfile::Builder::new().prefix(".lablens-").suffix(".parquet.tmp").tempfile_in(dir)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(true)
        .build();
    let mut writer = ArrowWriter::try_new(tmp.as_file(), batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    tmp.persist(path)
        .map_err(|e| LabLensError::Pipeline(PipelineError::Storage(format!("{}: {}", path.display(), e.error))))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sample() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("out.parquet");
        write_parquet_atomic(&path, &sample()).unwrap();
        // overwrite in place
        write_parquet_atomic(&path, &sample()).unwrap();
        let batches = read_parquet_batches(&path, 2).unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);
        assert_eq!(batches[0].num_columns(), 2);
        let leftovers = std::fs::read_dir(dir.path().join("sub")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_parquet_batches(Path::new("/no/such/file.parquet"), 16).unwrap_err();
        assert!(matches!(err, LabLensError::Io(_)));
    }
}
