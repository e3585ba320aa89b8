//! Enrolled reference embeddings and nearest-neighbour lookup.
//!
//! A [`GalleryIndex`] is an immutable snapshot. Rebuilds and per-identity
//! refreshes produce a new index; [`SharedGallery`] swaps snapshots
//! atomically so readers never observe a half-built index.

use crate::embedder::{load_image, EmbedError, FaceEmbedder};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use crate::types::{Embedding, Identity};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

/// One identity and the enrollment photos to derive its references from.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub identity: Identity,
    pub images: Vec<PathBuf>,
}

/// An identity with at least one usable reference embedding.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    identity: Identity,
    embeddings: Vec<Embedding>,
}

impl EnrolledIdentity {
    /// Returns `None` when `embeddings` is empty: such an identity can never
    /// be matched and must stay out of the gallery.
    pub fn new(identity: Identity, embeddings: Vec<Embedding>) -> Option<Self> {
        if embeddings.is_empty() {
            None
        } else {
            Some(Self { identity, embeddings })
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Reference embeddings in enrollment order.
    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }
}

/// Closest reference found by a [`NearestNeighborIndex`].
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub identity: &'a Identity,
    /// Cosine distance to the closest reference of `identity`.
    pub distance: f32,
}

/// Capability the matcher needs from a gallery.
///
/// [`GalleryIndex`] answers with a linear scan, O(total reference
/// embeddings). A vector index can be dropped in behind the same trait.
pub trait NearestNeighborIndex {
    /// Closest reference to `probe`, or `None` for an empty index.
    ///
    /// Among references at exactly the same distance, which one wins is
    /// unspecified.
    fn nearest(&self, probe: &Embedding) -> Option<Neighbor<'_>>;

    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    entries: Vec<EnrolledIdentity>,
}

impl GalleryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect identities into an index. A later entry for the same user id
    /// replaces an earlier one in place.
    pub fn from_identities(identities: impl IntoIterator<Item = EnrolledIdentity>) -> Self {
        let mut entries: Vec<EnrolledIdentity> = Vec::new();
        let mut positions: HashMap<i64, usize> = HashMap::new();
        for entry in identities {
            match positions.entry(entry.identity.user_id) {
                MapEntry::Occupied(slot) => entries[*slot.get()] = entry,
                MapEntry::Vacant(slot) => {
                    slot.insert(entries.len());
                    entries.push(entry);
                }
            }
        }
        Self { entries }
    }

    /// Embed every enrollment photo and index the identities that yield at
    /// least one usable face.
    ///
    /// Photos without a face or that cannot be decoded are skipped. Any other
    /// embedding failure aborts the build.
    pub fn build<E: FaceEmbedder + ?Sized>(
        embedder: &mut E,
        enrollments: &[Enrollment],
    ) -> Result<Self, EmbedError> {
        let mut identities = Vec::with_capacity(enrollments.len());
        for enrollment in enrollments {
            if let Some(entry) = Self::embed_identity(&mut *embedder, enrollment)? {
                identities.push(entry);
            }
        }
        let index = Self::from_identities(identities);
        tracing::info!(
            enrolled = enrollments.len(),
            indexed = index.len(),
            references = index.reference_count(),
            "gallery built"
        );
        Ok(index)
    }

    /// Embed one identity's photos. Unreadable photos and photos without a
    /// detectable face are skipped; `Ok(None)` if nothing usable remains.
    /// Model failures are returned, never skipped.
    pub fn embed_identity<E: FaceEmbedder + ?Sized>(
        embedder: &mut E,
        enrollment: &Enrollment,
    ) -> Result<Option<EnrolledIdentity>, EmbedError> {
        let user_id = enrollment.identity.user_id;
        let mut embeddings = Vec::with_capacity(enrollment.images.len());

        for path in &enrollment.images {
            match load_image(path).and_then(|image| embedder.embed(&image)) {
                Ok(embedding) => embeddings.push(embedding),
                Err(err) if err.is_input_error() => {
                    tracing::warn!(user_id, path = %path.display(), error = %err, "skipping enrollment image");
                }
                Err(err) => {
                    tracing::error!(user_id, path = %path.display(), error = %err, "embedding enrollment image failed");
                    return Err(err);
                }
            }
        }

        let entry = EnrolledIdentity::new(enrollment.identity.clone(), embeddings);
        if entry.is_none() {
            tracing::warn!(user_id, images = enrollment.images.len(), "no usable enrollment image; identity not indexed");
        }
        Ok(entry)
    }

    /// Recompute one identity without re-embedding anyone else. On error the
    /// current index is left as it is.
    pub fn refresh<E: FaceEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        enrollment: &Enrollment,
    ) -> Result<Self, EmbedError> {
        let entry = Self::embed_identity(embedder, enrollment)?;
        Ok(self.with_identity(enrollment.identity.user_id, entry))
    }

    /// Copy of this index with `user_id` replaced by `entry`, or removed when
    /// `entry` is `None`. Position of an existing identity is preserved.
    pub fn with_identity(&self, user_id: i64, entry: Option<EnrolledIdentity>) -> Self {
        let mut entries = self.entries.clone();
        let position = entries.iter().position(|e| e.identity.user_id == user_id);
        match (position, entry) {
            (Some(pos), Some(entry)) => entries[pos] = entry,
            (Some(pos), None) => {
                entries.remove(pos);
            }
            (None, Some(entry)) => entries.push(entry),
            (None, None) => {}
        }
        Self { entries }
    }

    pub fn get(&self, user_id: i64) -> Option<&EnrolledIdentity> {
        self.entries.iter().find(|e| e.identity.user_id == user_id)
    }

    /// Number of indexed identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of reference embeddings across all identities.
    pub fn reference_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }

    pub fn identities(&self) -> impl Iterator<Item = &EnrolledIdentity> {
        self.entries.iter()
    }

    /// Every (identity, reference) pair.
    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Embedding)> {
        self.entries
            .iter()
            .flat_map(|e| e.embeddings.iter().map(move |emb| (&e.identity, emb)))
    }
}

impl NearestNeighborIndex for GalleryIndex {
    fn nearest(&self, probe: &Embedding) -> Option<Neighbor<'_>> {
        let mut best: Option<Neighbor<'_>> = None;
        let mut lowest = f32::INFINITY;

        for (identity, reference) in self.iter() {
            let distance = probe.distance(reference);
            // Strict: the first reference at a given distance keeps it.
            if distance < lowest {
                lowest = distance;
                best = Some(Neighbor { identity, distance });
            }
        }

        best
    }

    fn is_empty(&self) -> bool {
        GalleryIndex::is_empty(self)
    }
}

/// Gallery snapshot shared between request handlers and the refresher.
///
/// Readers take an `Arc` of the current index under a short read lock;
/// writers compute the next index from the current one under the write lock
/// and swap it in.
#[derive(Debug, Clone, Default)]
pub struct SharedGallery {
    current: Arc<RwLock<Arc<GalleryIndex>>>,
}

impl SharedGallery {
    pub fn new(index: GalleryIndex) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<GalleryIndex> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole index.
    pub fn replace(&self, index: GalleryIndex) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }

    /// Replace or remove one identity, atomically with respect to other updates.
    pub fn set_identity(&self, user_id: i64, entry: Option<EnrolledIdentity>) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(guard.with_identity(user_id, entry));
    }
}
