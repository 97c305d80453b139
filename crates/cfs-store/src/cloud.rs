//! Generic remote cloud driver.
//!
//! The vendor-specific REST surface is behind [`CloudApi`]; this module owns
//! the load-bearing logic: the watched-folder listing, the change-cursor
//! diff and the persisted listing cache.
//!
//! Listing protocol: a start page token is fetched **before** the full
//! listing begins, so changes racing the initial listing are replayed by the
//! first diff instead of being lost. A diff drains every change page and
//! only then advances the stored cursor.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::ListingCache;
use crate::{ByteStream, ObjectStore, RemoteObject, StoreError, StoreResult};

/// One page of the initial folder listing.
pub struct ListPage {
    pub objects: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

/// One page of the change stream.
pub struct ChangePage {
    pub changes: Vec<ChangeItem>,
    pub next_page_token: Option<String>,
    /// Set on the final page; becomes the cursor for the next diff.
    pub new_start_page_token: Option<String>,
}

/// A single change. The driver filters by parent folder and kind; trashed
/// objects are removed from the listing, everything else is upserted.
pub struct ChangeItem {
    pub object: RemoteObject,
    pub trashed: bool,
    pub is_folder: bool,
    pub parents: Vec<String>,
}

/// The narrow remote REST surface a cloud backend must provide.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Resolve folder aliases (e.g. `root`) to a real folder id.
    async fn resolve_folder(&self, folder_id: &str) -> StoreResult<String>;

    /// A cursor pointing at "now" in the change stream.
    async fn start_page_token(&self) -> StoreResult<String>;

    /// One page of non-trashed, non-folder objects inside `folder_id`.
    async fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> StoreResult<ListPage>;

    /// One page of changes at `page_token`.
    async fn changes_page(&self, page_token: &str) -> StoreResult<ChangePage>;

    /// Ranged download of an object.
    async fn read_range(&self, id: &str, offset: u64, upper: u64) -> StoreResult<ByteStream>;

    /// Stream an object into `folder_id`; returns the new object id.
    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        reader: ByteStream,
        max_bytes: u64,
    ) -> StoreResult<String>;

    /// Soft-delete an object.
    async fn trash(&self, id: &str) -> StoreResult<()>;

    /// A stable id for the authenticated account (cache signature input).
    async fn account_id(&self) -> StoreResult<String>;
}

struct CloudState {
    folder_id: String,
    file_list: Option<HashMap<String, RemoteObject>>,
    change_token: String,
}

/// [`ObjectStore`] over any [`CloudApi`].
pub struct CloudStore<A> {
    api: A,
    cache_path: Option<PathBuf>,
    state: Mutex<CloudState>,
}

impl<A: CloudApi> CloudStore<A> {
    /// `folder_id` is the watched folder (aliases allowed); `cache_path`
    /// enables the persisted listing cache, `None` disables it.
    pub fn new(api: A, folder_id: impl Into<String>, cache_path: Option<PathBuf>) -> Self {
        CloudStore {
            api,
            cache_path,
            state: Mutex::new(CloudState {
                folder_id: folder_id.into(),
                file_list: None,
                change_token: String::new(),
            }),
        }
    }

    /// Signature binding a cache file to `(watched folder, account)`.
    async fn cache_sig(&self, folder_id: &str) -> StoreResult<String> {
        let account = self.api.account_id().await?;
        if account.len() < 3 {
            return Err(StoreError::Api(format!("invalid account id: {account:?}")));
        }
        Ok(format!("{folder_id}|{account}"))
    }

    /// Apply all pending change pages to `list`, advancing `token` only
    /// after the last page was consumed.
    async fn drain_changes(
        &self,
        folder_id: &str,
        list: &mut HashMap<String, RemoteObject>,
        token: &mut String,
    ) -> StoreResult<()> {
        if token.is_empty() {
            return Err(StoreError::NotInitialised);
        }

        let mut page_token = token.clone();
        loop {
            let page = self.api.changes_page(&page_token).await?;

            for change in page.changes {
                if change.is_folder {
                    continue;
                }
                if !change.parents.iter().any(|p| p == folder_id) {
                    continue;
                }
                if change.trashed {
                    list.remove(&change.object.id);
                } else {
                    list.insert(change.object.id.clone(), change.object);
                }
            }

            match page.next_page_token {
                Some(next) => page_token = next,
                None => {
                    if let Some(new_start) = page.new_start_page_token {
                        *token = new_start;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Restore the listing from the cache file. The cached cursor must
    /// survive one live diff before the cache is trusted.
    async fn try_restore_cache(&self, state: &mut CloudState, path: &PathBuf) -> StoreResult<()> {
        let cache = ListingCache::load(path).map_err(StoreError::Other)?;

        let sig = self.cache_sig(&state.folder_id).await?;
        if cache.cache_sig != sig {
            return Err(StoreError::Api(format!(
                "wrong cache signature: loaded={:?}, expected={:?}",
                cache.cache_sig, sig
            )));
        }

        let mut list = cache.file_list;
        let mut token = cache.change_start_page_token;
        self.drain_changes(&state.folder_id, &mut list, &mut token)
            .await?;

        debug!(objects = list.len(), "remote listing restored from cache");
        state.file_list = Some(list);
        state.change_token = token;
        Ok(())
    }

    fn write_cache(&self, state: &CloudState, sig: String) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let cache = ListingCache {
            file_list: state.file_list.clone().unwrap_or_default(),
            change_start_page_token: state.change_token.clone(),
            cache_sig: sig,
        };
        if let Err(e) = cache.save(path) {
            warn!("can't write listing cache: {e:#}");
        }
    }
}

#[async_trait]
impl<A: CloudApi> ObjectStore for CloudStore<A> {
    async fn read(&self, id: &str, offset: u64, upper: u64) -> StoreResult<ByteStream> {
        self.api.read_range(id, offset, upper).await
    }

    async fn save(&self, name: &str, reader: ByteStream, max_bytes: u64) -> StoreResult<String> {
        let folder_id = self.state.lock().await.folder_id.clone();
        self.api.upload(&folder_id, name, reader, max_bytes).await
    }

    async fn trash(&self, id: &str) -> StoreResult<()> {
        self.api.trash(id).await
    }

    async fn init_file_list(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.folder_id = self.api.resolve_folder(&state.folder_id).await?;

        if let Some(path) = self.cache_path.clone() {
            match self.try_restore_cache(&mut state, &path).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("listing cache rejected, falling back to full listing: {e}"),
            }
        }

        // The cursor is taken before the listing starts; anything that
        // changes mid-listing shows up again in the first diff.
        let start_token = self.api.start_page_token().await?;

        let mut list = HashMap::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .api
                .list_page(&state.folder_id, page_token.as_deref())
                .await?;
            for obj in page.objects {
                list.insert(obj.id.clone(), obj);
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        info!(objects = list.len(), "remote listing initialised");
        state.file_list = Some(list);
        state.change_token = start_token;
        Ok(())
    }

    async fn update_file_list(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;

        let mut list = state.file_list.clone().ok_or(StoreError::NotInitialised)?;
        let mut token = state.change_token.clone();
        let folder_id = state.folder_id.clone();

        self.drain_changes(&folder_id, &mut list, &mut token).await?;

        state.file_list = Some(list);
        state.change_token = token;

        // Best effort; a failed cache write never fails the refresh.
        match self.cache_sig(&folder_id).await {
            Ok(sig) => self.write_cache(&state, sig),
            Err(e) => warn!("can't compute cache signature: {e}"),
        }
        Ok(())
    }

    async fn file_list(&self) -> HashMap<String, RemoteObject> {
        self.state
            .lock()
            .await
            .file_list
            .clone()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn obj(id: &str, name: &str, size: i64) -> RemoteObject {
        RemoteObject {
            id: id.into(),
            name: name.into(),
            size,
            mtime: 1_700_000_000,
        }
    }

    /// Scripted in-memory backend: list pages served in order, change
    /// batches addressed by `t<n>` cursors.
    struct FakeApi {
        folder: String,
        account: String,
        list_pages: StdMutex<Vec<Vec<RemoteObject>>>,
        change_batches: Vec<Vec<ChangeItem>>,
    }

    impl FakeApi {
        fn new(
            list_pages: Vec<Vec<RemoteObject>>,
            change_batches: Vec<Vec<ChangeItem>>,
        ) -> Self {
            FakeApi {
                folder: "folder-1".into(),
                account: "account-1".into(),
                list_pages: StdMutex::new(list_pages),
                change_batches,
            }
        }

        fn change(&self, object: RemoteObject, trashed: bool) -> ChangeItem {
            ChangeItem {
                object,
                trashed,
                is_folder: false,
                parents: vec![self.folder.clone()],
            }
        }
    }

    #[async_trait]
    impl CloudApi for FakeApi {
        async fn resolve_folder(&self, folder_id: &str) -> StoreResult<String> {
            if folder_id == "root" || folder_id.is_empty() {
                Ok(self.folder.clone())
            } else {
                Ok(folder_id.to_string())
            }
        }

        async fn start_page_token(&self) -> StoreResult<String> {
            Ok("t0".into())
        }

        async fn list_page(
            &self,
            _folder_id: &str,
            _page_token: Option<&str>,
        ) -> StoreResult<ListPage> {
            let mut pages = self.list_pages.lock().unwrap();
            let objects = if pages.is_empty() {
                Vec::new()
            } else {
                pages.remove(0)
            };
            let next = if pages.is_empty() {
                None
            } else {
                Some("next".into())
            };
            Ok(ListPage {
                objects,
                next_page_token: next,
            })
        }

        async fn changes_page(&self, page_token: &str) -> StoreResult<ChangePage> {
            let idx: usize = page_token
                .strip_prefix('t')
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| StoreError::Api(format!("bad token {page_token:?}")))?;

            let changes = self
                .change_batches
                .get(idx)
                .map(|batch| {
                    batch
                        .iter()
                        .map(|c| ChangeItem {
                            object: c.object.clone(),
                            trashed: c.trashed,
                            is_folder: c.is_folder,
                            parents: c.parents.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let next = if idx < self.change_batches.len() {
                idx + 1
            } else {
                idx
            };
            Ok(ChangePage {
                changes,
                next_page_token: None,
                new_start_page_token: Some(format!("t{next}")),
            })
        }

        async fn read_range(&self, id: &str, _: u64, _: u64) -> StoreResult<ByteStream> {
            Err(StoreError::NotFound(id.into()))
        }

        async fn upload(&self, _: &str, _: &str, _: ByteStream, _: u64) -> StoreResult<String> {
            Err(StoreError::Api("not scripted".into()))
        }

        async fn trash(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn account_id(&self) -> StoreResult<String> {
            Ok(self.account.clone())
        }
    }

    #[tokio::test]
    async fn init_collects_all_pages() {
        let api = FakeApi::new(
            vec![
                vec![obj("a", "a.chunk", 10), obj("b", "b.chunk", 20)],
                vec![obj("c", "c.chunk", 30)],
            ],
            vec![],
        );
        let store = CloudStore::new(api, "root", None);

        store.init_file_list().await.unwrap();
        let list = store.file_list().await;
        assert_eq!(list.len(), 3);
        assert_eq!(list.get("c").unwrap().size, 30);
    }

    #[tokio::test]
    async fn update_before_init_fails() {
        let store = CloudStore::new(FakeApi::new(vec![], vec![]), "root", None);
        assert!(matches!(
            store.update_file_list().await,
            Err(StoreError::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn update_applies_upserts_and_trash() {
        let api = FakeApi::new(vec![vec![obj("a", "a.chunk", 10), obj("b", "b.chunk", 20)]], vec![]);
        let batch = vec![
            api.change(obj("a", "a.chunk", 10), true), // trashed → removed
            api.change(obj("d", "d.chunk", 40), false), // new → upserted
            ChangeItem {
                object: obj("x", "elsewhere", 1),
                trashed: false,
                is_folder: false,
                parents: vec!["other-folder".into()], // wrong parent → ignored
            },
            ChangeItem {
                object: obj("f", "a-folder", 0),
                trashed: false,
                is_folder: true, // folder → ignored
                parents: vec!["folder-1".into()],
            },
        ];
        let api = FakeApi {
            change_batches: vec![batch],
            ..api
        };
        let store = CloudStore::new(api, "root", None);

        store.init_file_list().await.unwrap();
        store.update_file_list().await.unwrap();

        let list = store.file_list().await;
        assert_eq!(list.len(), 2);
        assert!(list.contains_key("b"));
        assert!(list.contains_key("d"));
        assert!(!list.contains_key("a"));
        assert!(!list.contains_key("x"));
        assert!(!list.contains_key("f"));

        // The cursor advanced past the drained batch; a second refresh is a
        // no-op.
        store.update_file_list().await.unwrap();
        assert_eq!(store.file_list().await.len(), 2);
    }

    #[tokio::test]
    async fn cache_restores_without_full_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_path = tmp.path().join("listing.cache");

        // First run: full listing, then an update persists the cache.
        let api = FakeApi::new(vec![vec![obj("a", "a.chunk", 10)]], vec![vec![]]);
        let store = CloudStore::new(api, "root", Some(cache_path.clone()));
        store.init_file_list().await.unwrap();
        store.update_file_list().await.unwrap();
        assert!(cache_path.exists());

        // Second run: no list pages scripted — the listing must come from
        // the cache, validated by one live diff.
        let api = FakeApi::new(vec![], vec![vec![], vec![]]);
        let store = CloudStore::new(api, "root", Some(cache_path));
        store.init_file_list().await.unwrap();

        let list = store.file_list().await;
        assert_eq!(list.len(), 1);
        assert!(list.contains_key("a"));
    }

    #[tokio::test]
    async fn cache_signature_mismatch_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_path = tmp.path().join("listing.cache");

        let stale = ListingCache {
            file_list: [("ghost".to_string(), obj("ghost", "ghost.chunk", 1))]
                .into_iter()
                .collect(),
            change_start_page_token: "t9".into(),
            cache_sig: "folder-1|someone-else".into(),
        };
        stale.save(&cache_path).unwrap();

        let api = FakeApi::new(vec![vec![obj("real", "real.chunk", 5)]], vec![]);
        let store = CloudStore::new(api, "root", Some(cache_path));
        store.init_file_list().await.unwrap();

        let list = store.file_list().await;
        assert!(list.contains_key("real"));
        assert!(!list.contains_key("ghost"));
    }
}
