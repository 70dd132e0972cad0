//! Senate tramitación service (querystring GET, plain XML).
//!
//! The Senate has no standalone vote listing: roll calls are nested in the
//! tramitación document of each bill. Sessions are therefore identified as
//! `<boletin>#<ordinal>`, the 1-based position of the `votacion` element.
//!
//! A `fecha=01/01/<year>` query returns every bill entered since that date,
//! so results are narrowed to bills whose `fecha_ingreso` falls in the
//! requested year. The year document is fetched once per pass and shared by
//! the bill, session and roll-call calls of that year.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use congreso_core::{CanonicalDate, Chamber, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession};
use congreso_storage::HttpRequest;
use tracing::debug;
use uuid::Uuid;

use crate::xml::{parse_document, XmlElement};
use crate::{Coverage, FetchContext, SourceClient, SourceError, Transport, UpstreamRequest};

pub const DEFAULT_BASE_URL: &str = "https://tramitacion.senado.cl/wspublico";
pub const DEFAULT_COVERAGE: Coverage = Coverage {
    from: 1990,
    to: None,
};

pub const OP_SENATORS: &str = "senadores_vigentes";
pub const OP_TRAMITACION: &str = "tramitacion";

pub struct SenadoClient {
    base_url: String,
    coverage: Coverage,
    transport: Arc<dyn Transport>,
    documents: Mutex<YearDocuments>,
}

/// Tramitación documents of the most recent pass, by query year.
#[derive(Default)]
struct YearDocuments {
    run_id: Option<Uuid>,
    years: HashMap<i32, Arc<XmlElement>>,
}

impl YearDocuments {
    fn for_run(&mut self, run_id: Uuid) -> &mut HashMap<i32, Arc<XmlElement>> {
        if self.run_id != Some(run_id) {
            self.run_id = Some(run_id);
            self.years.clear();
        }
        &mut self.years
    }
}

impl SenadoClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            coverage: DEFAULT_COVERAGE,
            transport,
            documents: Mutex::new(YearDocuments::default()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    fn request(&self, operation: &'static str, params: Vec<(&'static str, String)>) -> UpstreamRequest {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let mut url = format!("{}/{operation}.php", self.base_url);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        UpstreamRequest {
            source: Chamber::Senado,
            operation,
            params,
            http: HttpRequest::get(url),
        }
    }

    async fn call(&self, ctx: &FetchContext, request: UpstreamRequest) -> Result<XmlElement, SourceError> {
        let body = self.transport.send(ctx, &request).await?;
        parse_document(&body).map_err(|err| SourceError::parse(Chamber::Senado, err, &body))
    }

    fn cached_documents(&self, ctx: &FetchContext) -> Vec<Arc<XmlElement>> {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents.for_run(ctx.run_id).values().cloned().collect()
    }

    async fn year_document(&self, ctx: &FetchContext, year: i32) -> Result<Arc<XmlElement>, SourceError> {
        {
            let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(doc) = documents.for_run(ctx.run_id).get(&year) {
                return Ok(doc.clone());
            }
        }
        let doc = Arc::new(
            self.call(
                ctx,
                self.request(OP_TRAMITACION, vec![("fecha", format!("01/01/{year}"))]),
            )
            .await?,
        );
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents.for_run(ctx.run_id).insert(year, doc.clone());
        Ok(doc)
    }
}

fn boletin_of(project: &XmlElement) -> Option<String> {
    project.text_at("descripcion/boletin")
}

/// Projects entered in `year`. A project whose entry date is missing or
/// unreadable cannot be placed and is kept.
fn projects_entered_in(doc: &XmlElement, year: i32) -> Vec<&XmlElement> {
    doc.descendants("proyecto")
        .into_iter()
        .filter(|p| {
            let entered = p.text_at("descripcion/fecha_ingreso").unwrap_or_default();
            CanonicalDate::parse(&entered).year().map_or(true, |y| y == year)
        })
        .collect()
}

fn find_project<'a>(doc: &'a XmlElement, boletin: &str) -> Option<&'a XmlElement> {
    doc.descendants("proyecto").into_iter().find(|p| {
        boletin_of(p)
            .map(|b| b.eq_ignore_ascii_case(boletin))
            .unwrap_or(false)
    })
}

pub fn parse_senators(doc: &XmlElement) -> Vec<RawParliamentarian> {
    doc.descendants("senador")
        .into_iter()
        .map(|s| RawParliamentarian {
            id: s.text_at("PARLID"),
            given_names: s.text_at("PARLNOMBRE"),
            paternal_surname: s.text_at("PARLAPELLIDOPATERNO"),
            maternal_surname: s.text_at("PARLAPELLIDOMATERNO"),
            full_name: None,
            region: s.text_at("REGION"),
            district: s.text_at("CIRCUNSCRIPCION"),
            party: s.text_at("PARTIDO"),
        })
        .collect()
}

pub fn parse_bills(doc: &XmlElement, year: i32) -> Vec<RawBill> {
    projects_entered_in(doc, year)
        .into_iter()
        .filter_map(|p| p.child("descripcion"))
        .map(|d| RawBill {
            boletin: d.text_at("boletin"),
            title: d.text_at("titulo"),
            status: d.text_at("estado"),
            chamber_of_origin: d.text_at("camara_origen"),
            urgency: d.text_at("urgencia_actual"),
            initiative: d.text_at("iniciativa"),
            entry_date: d.text_at("fecha_ingreso"),
        })
        .collect()
}

/// Sessions of every bill entered in `year`. Bills without a boletin cannot
/// be addressed later and are left out.
pub fn parse_vote_sessions(doc: &XmlElement, year: i32) -> Vec<RawVoteSession> {
    let mut sessions = Vec::new();
    for project in projects_entered_in(doc, year) {
        let Some(boletin) = boletin_of(project) else {
            continue;
        };
        for (index, vote) in project.find_all("votaciones/votacion").into_iter().enumerate() {
            sessions.push(RawVoteSession {
                session_id: Some(session_id(&boletin, index + 1)),
                boletin: Some(boletin.clone()),
                date: vote.text_at("FECHA"),
                description: vote.text_at("TEMA"),
                yes: vote.text_at("SI"),
                no: vote.text_at("NO"),
                abstain: vote.text_at("ABSTENCION"),
                paired: vote.text_at("PAREO"),
                quorum: vote.text_at("QUORUM"),
                result: vote.text_at("RESULTADO"),
            });
        }
    }
    sessions
}

pub fn parse_roll_call(doc: &XmlElement, session: &str) -> Result<Vec<RawVoteEntry>, String> {
    let (boletin, ordinal) = split_session_id(session)?;
    let Some(project) = find_project(doc, boletin) else {
        return Ok(Vec::new());
    };
    let votes = project.find_all("votaciones/votacion");
    let Some(vote) = votes.get(ordinal - 1) else {
        return Ok(Vec::new());
    };
    Ok(vote
        .find_all("DETALLE_VOTACION/VOTO")
        .into_iter()
        .map(|v| RawVoteEntry {
            session_id: session.to_string(),
            parliamentarian_ref: v.text_at("PARLID"),
            parliamentarian_name: v.text_at("PARLAMENTARIO"),
            option: v.text_at("SELECCION"),
        })
        .collect())
}

pub fn session_id(boletin: &str, ordinal: usize) -> String {
    format!("{}#{ordinal}", boletin.trim())
}

fn split_session_id(session: &str) -> Result<(&str, usize), String> {
    let (boletin, ordinal) = session
        .trim()
        .rsplit_once('#')
        .ok_or_else(|| format!("session id `{session}` is not <boletin>#<ordinal>"))?;
    let ordinal: usize = ordinal
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("session id `{session}` has no valid ordinal"))?;
    Ok((boletin, ordinal))
}

#[async_trait]
impl SourceClient for SenadoClient {
    fn source(&self) -> Chamber {
        Chamber::Senado
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    async fn fetch_parliamentarians(
        &self,
        ctx: &FetchContext,
    ) -> Result<Vec<RawParliamentarian>, SourceError> {
        let doc = self.call(ctx, self.request(OP_SENATORS, vec![])).await?;
        let senators = parse_senators(&doc);
        debug!(count = senators.len(), "senado senators fetched");
        Ok(senators)
    }

    async fn fetch_bills(&self, ctx: &FetchContext, year: i32) -> Result<Vec<RawBill>, SourceError> {
        if !self.coverage.contains(year) {
            return Ok(Vec::new());
        }
        let doc = self.year_document(ctx, year).await?;
        let bills = parse_bills(&doc, year);
        debug!(year, count = bills.len(), "senado bills fetched");
        Ok(bills)
    }

    async fn fetch_vote_sessions(
        &self,
        ctx: &FetchContext,
        year: i32,
    ) -> Result<Vec<RawVoteSession>, SourceError> {
        if !self.coverage.contains(year) {
            return Ok(Vec::new());
        }
        let doc = self.year_document(ctx, year).await?;
        Ok(parse_vote_sessions(&doc, year))
    }

    async fn fetch_roll_call(
        &self,
        ctx: &FetchContext,
        session_id: &str,
    ) -> Result<Vec<RawVoteEntry>, SourceError> {
        let (boletin, _) = split_session_id(session_id)
            .map_err(|reason| SourceError::parse(Chamber::Senado, reason, session_id.as_bytes()))?;
        let cached = self
            .cached_documents(ctx)
            .into_iter()
            .find(|doc| find_project(doc, boletin).is_some());
        let doc = match cached {
            Some(doc) => doc,
            None => Arc::new(
                self.call(
                    ctx,
                    self.request(OP_TRAMITACION, vec![("boletin", boletin.to_string())]),
                )
                .await?,
            ),
        };
        parse_roll_call(&doc, session_id)
            .map_err(|reason| SourceError::parse(Chamber::Senado, reason, session_id.as_bytes()))
    }
}
