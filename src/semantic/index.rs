//! In-memory brute-force vector index with squared euclidean distance.
//!
//! Two layers:
//! - `VectorIndex`: a flat matrix of rows, searchable by k-nearest
//! - `NoteIndex`: a `VectorIndex` plus the row → note id mapping, which is
//!   the only way callers mutate rows so both stay the same length

use std::collections::HashSet;

use crate::notes::NoteId;
use crate::semantic::matrix::Embeddings;

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Row mapping has {mapping} entries but index has {rows} rows")]
    Inconsistent { rows: usize, mapping: usize },
}

/// Nearest rows for a query, closest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Neighbors {
    pub distances: Vec<f32>,
    pub rows: Vec<usize>,
}

/// Append-mostly matrix of embedding rows.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    data: Vec<f32>,
    dimensions: usize,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of rows in the index.
    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append every row of `vectors`.
    pub fn add(&mut self, vectors: &Embeddings) -> Result<(), IndexError> {
        if vectors.dimensions() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vectors.dimensions(),
            });
        }

        self.data.extend_from_slice(vectors.as_slice());
        Ok(())
    }

    /// Find the `k` nearest rows to `query`.
    ///
    /// Ties are broken by row order so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Neighbors, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if k == 0 || self.is_empty() {
            return Ok(Neighbors::default());
        }

        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(row, vector)| (Self::squared_l2(query, vector), row))
            .collect();

        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(Neighbors {
            distances: scored.iter().map(|(distance, _)| *distance).collect(),
            rows: scored.iter().map(|(_, row)| *row).collect(),
        })
    }

    /// Remove the given rows, keeping survivors in their relative order.
    ///
    /// Rows out of range are ignored. Returns the number of rows removed.
    pub fn remove_rows(&mut self, rows: &HashSet<usize>) -> usize {
        if rows.is_empty() || self.is_empty() {
            return 0;
        }

        let before = self.len();
        let mut kept = Vec::with_capacity(self.data.len());
        for (row, vector) in self.data.chunks_exact(self.dimensions).enumerate() {
            if !rows.contains(&row) {
                kept.extend_from_slice(vector);
            }
        }
        self.data = kept;

        before - self.len()
    }

    fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }
}

/// A hit from [`NoteIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct NoteHit {
    pub note_id: NoteId,
    pub distance: f32,
}

/// Vector index plus the note id of every row.
#[derive(Debug, Clone)]
pub struct NoteIndex {
    vectors: VectorIndex,
    mapping: Vec<NoteId>,
}

impl NoteIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            vectors: VectorIndex::new(dimensions),
            mapping: Vec::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.vectors.dimensions()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Row → note id mapping, one entry per row.
    pub fn mapping(&self) -> &[NoteId] {
        &self.mapping
    }

    /// Append one row per sentence of a note.
    pub fn add_note(&mut self, note_id: NoteId, embeddings: &Embeddings) -> Result<(), IndexError> {
        self.vectors.add(embeddings)?;
        self.mapping
            .extend(std::iter::repeat(note_id).take(embeddings.rows()));
        Ok(())
    }

    /// Row indices currently mapped to `note_id`.
    pub fn rows_of(&self, note_id: NoteId) -> HashSet<usize> {
        self.mapping
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == note_id)
            .map(|(row, _)| row)
            .collect()
    }

    /// Remove every row of `note_id`. Returns the number of rows removed.
    pub fn remove_note(&mut self, note_id: NoteId) -> usize {
        let rows = self.rows_of(note_id);
        self.remove_rows(&rows)
    }

    /// Remove rows from the index and the mapping in one step.
    pub fn remove_rows(&mut self, rows: &HashSet<usize>) -> usize {
        let removed = self.vectors.remove_rows(rows);

        let mut row = 0;
        self.mapping.retain(|_| {
            let keep = !rows.contains(&row);
            row += 1;
            keep
        });

        removed
    }

    /// Nearest rows resolved to note ids, closest first.
    ///
    /// A note with several matching sentences shows up once per row.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<NoteHit>, IndexError> {
        self.check_consistency()?;

        let neighbors = self.vectors.search(query, k)?;
        Ok(neighbors
            .rows
            .iter()
            .zip(neighbors.distances.iter())
            .map(|(row, distance)| NoteHit {
                note_id: self.mapping[*row],
                distance: *distance,
            })
            .collect())
    }

    /// Forget the note of the last row, leaving the mapping one entry short.
    #[cfg(test)]
    pub fn truncate_mapping(&mut self) {
        self.mapping.pop();
    }

    pub fn check_consistency(&self) -> Result<(), IndexError> {
        if self.mapping.len() != self.vectors.len() {
            return Err(IndexError::Inconsistent {
                rows: self.vectors.len(),
                mapping: self.mapping.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<f32>>) -> Embeddings {
        let dimensions = rows[0].len();
        Embeddings::from_rows(dimensions, rows).unwrap()
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(384);
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_add_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        let result = index.add(&matrix(vec![vec![1.0, 0.0, 0.0, 0.0]]));
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_returns_ascending_distances() {
        let mut index = VectorIndex::new(2);
        index
            .add(&matrix(vec![vec![5.0, 0.0], vec![1.0, 0.0], vec![0.0, 3.0]]))
            .unwrap();

        let neighbors = index.search(&[0.0, 0.0], 3).unwrap();

        assert_eq!(neighbors.rows, vec![1, 2, 0]);
        assert_eq!(neighbors.distances, vec![1.0, 9.0, 25.0]);
    }

    #[test]
    fn test_search_with_limit() {
        let mut index = VectorIndex::new(1);
        index
            .add(&matrix((0..10).map(|i| vec![i as f32]).collect()))
            .unwrap();

        let neighbors = index.search(&[0.0], 3).unwrap();
        assert_eq!(neighbors.rows, vec![0, 1, 2]);

        let neighbors = index.search(&[0.0], 50).unwrap();
        assert_eq!(neighbors.rows.len(), 10);
    }

    #[test]
    fn test_search_ties_keep_row_order() {
        let mut index = VectorIndex::new(1);
        index
            .add(&matrix(vec![vec![1.0], vec![-1.0], vec![1.0]]))
            .unwrap();

        let neighbors = index.search(&[0.0], 3).unwrap();
        assert_eq!(neighbors.rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_search_query_dimension_mismatch() {
        let index = VectorIndex::new(3);
        let result = index.search(&[1.0], 1);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_remove_rows_preserves_order() {
        let mut index = VectorIndex::new(1);
        index
            .add(&matrix(vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]]))
            .unwrap();

        let removed = index.remove_rows(&HashSet::from([1, 3, 99]));

        assert_eq!(removed, 2);
        let neighbors = index.search(&[0.0], 10).unwrap();
        assert_eq!(neighbors.distances, vec![0.0, 4.0]);
    }

    #[test]
    fn test_note_index_mapping_follows_rows() {
        let mut index = NoteIndex::new(1);
        index.add_note(7, &matrix(vec![vec![0.0], vec![1.0]])).unwrap();
        index.add_note(8, &matrix(vec![vec![2.0]])).unwrap();
        index.add_note(7, &matrix(vec![vec![3.0]])).unwrap();

        assert_eq!(index.mapping(), &[7, 7, 8, 7]);
        assert_eq!(index.rows_of(7), HashSet::from([0, 1, 3]));

        assert_eq!(index.remove_note(7), 3);
        assert_eq!(index.mapping(), &[8]);
        assert_eq!(index.len(), 1);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_mapping_length_matches_rows_after_every_operation() {
        let mut index = NoteIndex::new(2);
        let ops: Vec<(bool, NoteId, usize)> = vec![
            (true, 1, 3),
            (true, 2, 1),
            (false, 1, 0),
            (true, 3, 4),
            (true, 1, 2),
            (false, 9, 0),
            (false, 3, 0),
            (true, 2, 0),
            (false, 2, 0),
        ];

        for (add, note_id, sentences) in ops {
            if add {
                let rows = (0..sentences).map(|i| vec![i as f32, note_id as f32]).collect();
                let embeddings = Embeddings::from_rows(2, rows).unwrap();
                index.add_note(note_id, &embeddings).unwrap();
            } else {
                index.remove_note(note_id);
            }
            assert_eq!(index.mapping().len(), index.len());
        }

        assert_eq!(index.mapping(), &[1, 1]);
    }

    #[test]
    fn test_note_search_keeps_duplicates() {
        let mut index = NoteIndex::new(1);
        index.add_note(1, &matrix(vec![vec![0.0], vec![0.5]])).unwrap();
        index.add_note(2, &matrix(vec![vec![10.0]])).unwrap();

        let hits = index.search(&[0.0], 3).unwrap();
        let ids: Vec<NoteId> = hits.iter().map(|hit| hit.note_id).collect();
        assert_eq!(ids, vec![1, 1, 2]);
    }
}
