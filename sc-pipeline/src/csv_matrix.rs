use anyhow::{format_err, Context, Error};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use ndarray::Array2;
use sc_types::{ExpressionMatrix, ScanError};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Whether a field counts as a missing value
fn is_missing(field: &str) -> bool {
    field.is_empty() || field.eq_ignore_ascii_case("na") || field.eq_ignore_ascii_case("nan")
}

/// Load a gene-by-cell matrix from a CSV file, gunzipping it when the name ends in `.gz`.
/// See [`read_csv`] for the layout.
pub fn load_csv(path: impl AsRef<Path>) -> Result<ExpressionMatrix, Error> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| path.display().to_string())?;
    let reader: Box<dyn Read> = if path.extension().map_or(false, |e| e == "gz") {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    read_csv(reader).with_context(|| path.display().to_string())
}

/// Read a gene-by-cell matrix. The header row holds the cell ids after a leading
/// gene-id column name; every other row is a gene id followed by one value per cell.
/// Empty, `NA` and `NaN` fields are missing. Cell columns holding any other
/// non-numeric text are dropped.
pub fn read_csv(reader: impl Read) -> Result<ExpressionMatrix, Error> {
    let mut csv = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

    let header = csv.headers()?.clone();
    let cells: Vec<String> = header.iter().skip(1).map(|h| h.trim().to_owned()).collect();
    let mut numeric = vec![true; cells.len()];
    let mut genes = Vec::new();
    let mut values = Vec::new();

    for (line, record) in csv.records().enumerate() {
        let record = record.with_context(|| format!("row {}", line + 2))?;
        let mut fields = record.iter();
        let gene = fields
            .next()
            .ok_or_else(|| ScanError::invalid(format!("row {} is empty", line + 2)))?;
        genes.push(gene.trim().to_owned());
        for (c, field) in fields.enumerate() {
            let field = field.trim();
            let v = if is_missing(field) {
                f64::NAN
            } else {
                match field.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => {
                        numeric[c] = false;
                        f64::NAN
                    }
                }
            };
            values.push(v);
        }
    }

    let keep: Vec<usize> = (0..cells.len()).filter(|&c| numeric[c]).collect();
    if keep.len() < cells.len() {
        let dropped: Vec<&str> = (0..cells.len())
            .filter(|&c| !numeric[c])
            .map(|c| cells[c].as_str())
            .collect();
        warn!("dropping {} non-numeric columns: {:?}", dropped.len(), dropped);
    }

    let ncols = cells.len();
    let matrix = Array2::from_shape_fn((genes.len(), keep.len()), |(g, c)| values[g * ncols + keep[c]]);
    let cells = keep.iter().map(|&c| cells[c].clone()).collect();
    let m = ExpressionMatrix::new(genes, cells, matrix)?;
    info!(
        "loaded {} genes x {} cells ({} missing values)",
        m.num_genes(),
        m.num_cells(),
        m.count_missing()
    );
    Ok(m)
}

/// CSV writer that gzips into `path`
pub fn gz_csv_writer(path: impl AsRef<Path>) -> Result<csv::Writer<GzEncoder<File>>, Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    Ok(csv::WriterBuilder::new().from_writer(GzEncoder::new(file, Compression::default())))
}

/// Flush a writer from [`gz_csv_writer`] and finish the gzip stream
pub fn finish_gz(wtr: csv::Writer<GzEncoder<File>>) -> Result<(), Error> {
    let gz = wtr
        .into_inner()
        .map_err(|e| format_err!("flushing CSV output: {}", e.error()))?;
    gz.finish()?;
    Ok(())
}

/// Write `matrix` in the layout [`read_csv`] accepts, with `corner` as the gene-id column name
pub fn write_csv<W: Write>(matrix: &ExpressionMatrix, corner: &str, wtr: &mut csv::Writer<W>) -> Result<(), Error> {
    let mut header = vec![corner.to_owned()];
    header.extend(matrix.cell_ids.iter().cloned());
    wtr.write_record(&header)?;
    for (gene, row) in matrix.gene_ids.iter().zip(matrix.matrix.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(gene.clone());
        record.extend(row.iter().map(|v| if v.is_nan() { String::new() } else { v.to_string() }));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
