//! Splits module definitions into offset-addressed statement spans.
//!
//! The grammar is deliberately conservative: statements begin at statement
//! keywords found at parenthesis depth zero outside `CASE ... END`, end at `;`
//! or at the next statement keyword, and a handful of continuation rules keep
//! compound statements (`INSERT ... SELECT`, `UPDATE ... SET`, CTEs, `MERGE`,
//! set operators, cursor declarations) in one piece. `BEGIN`/`END`/`ELSE`,
//! `TRY`/`CATCH` block markers and labels are structure and belong to no span.
//! `IF` and `WHILE` spans cover only the keyword and its predicate.

mod lexer;

use crate::error::SegmentationError;
use crate::filter::ExcludeFilter;
use crate::types::StatementSpan;
use lexer::{tokenize, Cursor, Token, TokenKind};

use log::debug;

pub struct SourceSegmenter<'f> {
    filter: &'f ExcludeFilter,
}

impl<'f> SourceSegmenter<'f> {
    pub fn new(filter: &'f ExcludeFilter) -> Self {
        SourceSegmenter { filter }
    }

    /// Returns no spans at all for excluded names.
    pub fn segment(&self, name: &str, text: &str) -> Result<Vec<StatementSpan>, SegmentationError> {
        if self.filter.is_excluded(name) {
            debug!("Skipping excluded object '{}'", name);
            return Ok(vec![]);
        }
        segment_source(text)
    }
}

pub fn segment_source(text: &str) -> Result<Vec<StatementSpan>, SegmentationError> {
    let tokens = tokenize(text)?;
    let mut splitter = Splitter::default();
    match locate_body(&tokens)? {
        Body::Statements(start) => splitter.run(&tokens[start..])?,
        Body::Inline(start) => splitter.single(&tokens[start..])?,
    }
    Ok(splitter.spans)
}

enum Body {
    Statements(usize),
    /// Inline table-valued function: the whole body is one `RETURN`
    Inline(usize),
}

const MODULE_WORDS: [&str; 4] = ["PROC", "PROCEDURE", "FUNCTION", "TRIGGER"];

/// Finds the first token after the module header's `AS`. Text that isn't a
/// `CREATE`/`ALTER` of a module is a bare batch and starts at token zero.
fn locate_body(tokens: &[Token]) -> Result<Body, SegmentationError> {
    let is_module = tokens
        .first()
        .is_some_and(|t| t.is_word("CREATE") || t.is_word("ALTER"))
        && tokens
            .iter()
            .take(4)
            .any(|t| MODULE_WORDS.iter().any(|w| t.is_word(w)));
    if !is_module {
        return Ok(Body::Statements(0));
    }

    let mut depth = 0usize;
    let mut inline = false;
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_punct('(') {
            depth += 1;
        } else if tok.is_punct(')') {
            depth = depth
                .checked_sub(1)
                .ok_or(SegmentationError::UnbalancedParenthesis {
                    line: tok.start.line,
                })?;
        }
        if depth > 0 {
            continue;
        }

        if tok.is_word("RETURNS") && tokens.get(i + 1).is_some_and(|t| t.is_word("TABLE")) {
            inline = true;
        }
        // `WITH EXECUTE AS` and `@param AS type` are not the body keyword
        let prev = i.checked_sub(1).map(|p| &tokens[p]);
        let header_as = prev.is_some_and(|p| {
            p.is_word("EXECUTE") || p.is_word("EXEC") || p.kind == TokenKind::Variable
        });
        if tok.is_word("AS") && !header_as {
            return Ok(if inline {
                Body::Inline(i + 1)
            } else {
                Body::Statements(i + 1)
            });
        }
    }

    Err(SegmentationError::MissingBody)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lead {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Set,
    Exec,
    Declare,
    If,
    While,
    With,
    Alter,
    Ddl,
    Permission,
    Other,
}

fn statement_lead(word: &str) -> Option<Lead> {
    let lead = match word {
        "SELECT" => Lead::Select,
        "INSERT" => Lead::Insert,
        "UPDATE" => Lead::Update,
        "DELETE" => Lead::Delete,
        "MERGE" => Lead::Merge,
        "SET" => Lead::Set,
        "EXEC" | "EXECUTE" => Lead::Exec,
        "DECLARE" => Lead::Declare,
        "IF" => Lead::If,
        "WHILE" => Lead::While,
        "ALTER" => Lead::Alter,
        "CREATE" | "DROP" | "TRUNCATE" | "ENABLE" | "DISABLE" => Lead::Ddl,
        "GRANT" | "DENY" | "REVOKE" => Lead::Permission,
        "RETURN" | "PRINT" | "RAISERROR" | "THROW" | "BREAK" | "CONTINUE" | "GOTO"
        | "WAITFOR" | "COMMIT" | "ROLLBACK" | "SAVE" | "OPEN" | "FETCH" | "CLOSE"
        | "DEALLOCATE" | "BULK" | "RECEIVE" | "SEND" | "DBCC" | "REVERT" | "CHECKPOINT"
        | "RECONFIGURE" | "KILL" | "USE" => Lead::Other,
        _ => return None,
    };
    Some(lead)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Plain,
    Try,
    Catch,
}

impl Block {
    fn describe(self) -> &'static str {
        match self {
            Block::Plain => "BEGIN",
            Block::Try => "BEGIN TRY",
            Block::Catch => "BEGIN CATCH",
        }
    }
}

struct Open {
    lead: Lead,
    start: Cursor,
    end: Cursor,
}

#[derive(Default)]
struct Splitter {
    spans: Vec<StatementSpan>,
    open: Option<Open>,
    blocks: Vec<(Block, u32)>,
    cases: Vec<u32>,
    depth: usize,
}

impl Splitter {
    fn run(&mut self, tokens: &[Token]) -> Result<(), SegmentationError> {
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            let prev = i.checked_sub(1).map(|p| &tokens[p]);
            let after_dot = prev.is_some_and(|p| p.is_punct('.'));
            i += 1;

            match tok.kind {
                TokenKind::Punct if tok.is_punct('(') => {
                    self.depth += 1;
                    self.extend(tok);
                }
                TokenKind::Punct if tok.is_punct(')') => {
                    self.depth = self.depth.checked_sub(1).ok_or(
                        SegmentationError::UnbalancedParenthesis {
                            line: tok.start.line,
                        },
                    )?;
                    self.extend(tok);
                }
                TokenKind::Punct if tok.is_punct(';') && self.depth == 0 => {
                    if self.open.is_some() {
                        self.extend(tok);
                        self.close();
                    }
                }
                TokenKind::Word if self.depth == 0 && !after_dot => {
                    i += self.word(tokens, i - 1)?;
                }
                _ => self.extend(tok),
            }
        }
        self.finish(tokens.last())
    }

    /// Handles a keyword candidate at depth zero and returns how many of the
    /// following tokens it consumed.
    fn word(&mut self, tokens: &[Token], at: usize) -> Result<usize, SegmentationError> {
        let tok = &tokens[at];
        let prev = at.checked_sub(1).map(|p| &tokens[p]);
        let next = tokens.get(at + 1);
        let upper = tok.text.to_ascii_uppercase();

        if upper == "CASE" {
            self.cases.push(tok.start.line);
            self.extend(tok);
            return Ok(0);
        }
        if !self.cases.is_empty() {
            if upper == "END" {
                self.cases.pop();
            }
            self.extend(tok);
            return Ok(0);
        }

        match upper.as_str() {
            "BEGIN" => {
                let follower = next.map(|n| n.text.to_ascii_uppercase());
                match follower.as_deref() {
                    Some("TRAN" | "TRANSACTION" | "DISTRIBUTED" | "DIALOG" | "CONVERSATION") => {
                        self.start(tok, Lead::Other);
                        Ok(0)
                    }
                    Some("TRY") => {
                        self.close();
                        self.blocks.push((Block::Try, tok.start.line));
                        Ok(1)
                    }
                    Some("CATCH") => {
                        self.close();
                        self.blocks.push((Block::Catch, tok.start.line));
                        Ok(1)
                    }
                    _ => {
                        self.close();
                        self.blocks.push((Block::Plain, tok.start.line));
                        Ok(0)
                    }
                }
            }
            "END" if next.is_some_and(|n| n.is_word("CONVERSATION")) => {
                self.start(tok, Lead::Other);
                Ok(0)
            }
            "END" => {
                self.close();
                let unmatched = SegmentationError::UnmatchedEnd {
                    line: tok.start.line,
                };
                let (block, _) = self.blocks.pop().ok_or(unmatched.clone())?;
                let closes = match next {
                    Some(n) if n.is_word("TRY") => Some(Block::Try),
                    Some(n) if n.is_word("CATCH") => Some(Block::Catch),
                    _ => None,
                };
                match closes {
                    Some(kind) if kind == block => Ok(1),
                    Some(_) => Err(unmatched),
                    None => Ok(0),
                }
            }
            "ELSE" => {
                self.close();
                Ok(0)
            }
            "WITH" if self.open.is_none() => {
                self.start(tok, Lead::With);
                Ok(0)
            }
            "VALUES" => {
                // no further SELECT/EXEC belongs to an INSERT once VALUES appear
                if let Some(open) = self.open.as_mut() {
                    if open.lead == Lead::Insert {
                        open.lead = Lead::Other;
                    }
                }
                self.extend(tok);
                Ok(0)
            }
            word => {
                if let Some(lead) = statement_lead(word) {
                    if self.continues(lead, prev, next) {
                        self.extend(tok);
                    } else if lead == Lead::Update && next.is_some_and(|n| n.is_word("STATISTICS")) {
                        // no SET clause to wait for
                        self.start(tok, Lead::Other);
                    } else {
                        self.start(tok, lead);
                    }
                    return Ok(0);
                }
                let is_label = next.is_some_and(|n| n.is_punct(':'))
                    && !tokens.get(at + 2).is_some_and(|t| t.is_punct(':'));
                if is_label {
                    self.close();
                    return Ok(1);
                }
                self.extend(tok);
                Ok(0)
            }
        }
    }

    /// Whether keyword `kw` belongs to the open statement rather than starting
    /// a new one. May re-lead the open statement to what its body turned into.
    fn continues(&mut self, kw: Lead, prev: Option<&Token>, next: Option<&Token>) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        let after = |w: &str| prev.is_some_and(|p| p.is_word(w));
        let set_operator = after("UNION") || after("ALL") || after("EXCEPT") || after("INTERSECT");

        let (belongs, relead) = match (kw, open.lead) {
            (_, Lead::Permission) => (
                matches!(
                    kw,
                    Lead::Select | Lead::Insert | Lead::Update | Lead::Delete | Lead::Exec
                        | Lead::Alter | Lead::Ddl
                ),
                None,
            ),
            (Lead::Select, _) if set_operator => (true, None),
            (Lead::Select, Lead::Insert | Lead::With) => (true, Some(Lead::Select)),
            (Lead::Select, Lead::Declare) if after("FOR") => (true, Some(Lead::Select)),
            (Lead::Exec, Lead::Insert) => (true, Some(Lead::Exec)),
            (Lead::Insert, _) if after("BULK") => (true, None),
            (Lead::Insert | Lead::Update | Lead::Delete | Lead::Merge, Lead::With) => {
                (true, Some(kw))
            }
            (Lead::Insert | Lead::Update | Lead::Delete, Lead::Merge) => (true, None),
            (Lead::Update, _) if after("FOR") => (true, None),
            (Lead::Update, Lead::If | Lead::While) => {
                (next.is_some_and(|n| n.is_punct('(')), None)
            }
            // UPDATE takes exactly one SET clause
            (Lead::Set, Lead::Update) => (true, Some(Lead::Other)),
            (Lead::Set, Lead::Merge | Lead::Alter) => (true, None),
            (Lead::Alter, Lead::Alter) => (next.is_some_and(|n| n.is_word("COLUMN")), None),
            (Lead::Ddl, Lead::Alter) => (true, None),
            (Lead::If, Lead::Ddl) => (next.is_some_and(|n| n.is_word("EXISTS")), None),
            _ => (false, None),
        };

        if belongs {
            if let Some(lead) = relead {
                open.lead = lead;
            }
        }
        belongs
    }

    fn extend(&mut self, tok: &Token) {
        match self.open.as_mut() {
            Some(open) => open.end = tok.end,
            None => {
                self.open = Some(Open {
                    lead: Lead::Other,
                    start: tok.start,
                    end: tok.end,
                })
            }
        }
    }

    fn start(&mut self, tok: &Token, lead: Lead) {
        self.close();
        self.open = Some(Open {
            lead,
            start: tok.start,
            end: tok.end,
        });
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            self.spans.push(StatementSpan {
                ordinal: self.spans.len(),
                start_offset: open.start.utf16,
                end_offset: open.end.utf16,
                start_line: open.start.line,
                end_line: open.end.line,
                executed: false,
            });
        }
    }

    fn finish(&mut self, last: Option<&Token>) -> Result<(), SegmentationError> {
        self.close();
        if let Some((block, line)) = self.blocks.last() {
            return Err(SegmentationError::UnterminatedBlock {
                block: block.describe(),
                line: *line,
            });
        }
        if let Some(line) = self.cases.last() {
            return Err(SegmentationError::UnterminatedBlock {
                block: "CASE",
                line: *line,
            });
        }
        if self.depth > 0 {
            return Err(SegmentationError::UnbalancedParenthesis {
                line: last.map_or(1, |t| t.end.line),
            });
        }
        Ok(())
    }

    fn single(&mut self, tokens: &[Token]) -> Result<(), SegmentationError> {
        for tok in tokens {
            if tok.is_punct('(') {
                self.depth += 1;
            } else if tok.is_punct(')') {
                self.depth =
                    self.depth
                        .checked_sub(1)
                        .ok_or(SegmentationError::UnbalancedParenthesis {
                            line: tok.start.line,
                        })?;
            }
            self.extend(tok);
        }
        self.finish(tokens.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(src: &str) -> Vec<String> {
        let spans = segment_source(src).unwrap();
        let utf16: Vec<u16> = src.encode_utf16().collect();
        spans
            .iter()
            .map(|s| String::from_utf16(&utf16[s.start_offset..s.end_offset]).unwrap())
            .collect()
    }

    fn assert_partition(src: &str) {
        let spans = segment_source(src).unwrap();
        for (i, pair) in spans.windows(2).enumerate() {
            assert!(pair[0].end_offset <= pair[1].start_offset, "overlap at {}", i);
        }
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.ordinal, i);
            assert!(span.start_offset < span.end_offset);
            assert!(span.start_line <= span.end_line);
        }
    }

    #[test]
    fn procedure_body_splits_on_keywords_and_semicolons() {
        let src = "CREATE PROCEDURE dbo.Proc1 @a int AS\nBEGIN\n  SET NOCOUNT ON;\n  SELECT @a\n  PRINT 'done'\nEND";
        assert_eq!(
            statements(src),
            vec!["SET NOCOUNT ON;", "SELECT @a", "PRINT 'done'"]
        );
        assert_partition(src);
    }

    #[test]
    fn alter_column_and_update_statistics_stand_alone() {
        let src = "CREATE PROC p AS\nALTER TABLE dbo.T ALTER COLUMN c int NULL\nUPDATE STATISTICS dbo.T\nSET NOCOUNT ON";
        assert_eq!(
            statements(src),
            vec![
                "ALTER TABLE dbo.T ALTER COLUMN c int NULL",
                "UPDATE STATISTICS dbo.T",
                "SET NOCOUNT ON"
            ]
        );
        assert_partition(src);
    }

    #[test]
    fn lines_are_one_based() {
        let src = "CREATE PROC p AS\nSELECT 1\nSELECT\n  2";
        let spans = segment_source(src).unwrap();
        assert_eq!((spans[0].start_line, spans[0].end_line), (2, 2));
        assert_eq!((spans[1].start_line, spans[1].end_line), (3, 4));
    }

    #[test]
    fn if_spans_cover_only_the_predicate() {
        let src = "CREATE PROC p AS\nIF @x = 1 AND EXISTS (SELECT 1 FROM t)\n  SET @y = 1\nELSE\nBEGIN\n  SET @y = 2\nEND";
        assert_eq!(
            statements(src),
            vec![
                "IF @x = 1 AND EXISTS (SELECT 1 FROM t)",
                "SET @y = 1",
                "SET @y = 2"
            ]
        );
    }

    #[test]
    fn compound_statements_stay_together() {
        let src = "CREATE PROCEDURE p AS
INSERT INTO t (a) SELECT a FROM s UNION ALL SELECT b FROM u
UPDATE t SET a = 1 WHERE a = 2
SELECT 3;
WITH cte AS (SELECT 1 AS x) DELETE FROM t WHERE a IN (SELECT x FROM cte)
DECLARE c CURSOR FOR SELECT a FROM t FOR UPDATE OF a
INSERT INTO t EXEC dbo.Other
INSERT INTO t VALUES (1)
SELECT 4";
        assert_eq!(
            statements(src),
            vec![
                "INSERT INTO t (a) SELECT a FROM s UNION ALL SELECT b FROM u",
                "UPDATE t SET a = 1 WHERE a = 2",
                "SELECT 3;",
                "WITH cte AS (SELECT 1 AS x) DELETE FROM t WHERE a IN (SELECT x FROM cte)",
                "DECLARE c CURSOR FOR SELECT a FROM t FOR UPDATE OF a",
                "INSERT INTO t EXEC dbo.Other",
                "INSERT INTO t VALUES (1)",
                "SELECT 4",
            ]
        );
    }

    #[test]
    fn merge_keeps_its_branches() {
        let src = "CREATE PROC p AS
MERGE t USING s ON t.id = s.id
WHEN MATCHED THEN UPDATE SET t.v = s.v
WHEN NOT MATCHED THEN INSERT (id, v) VALUES (s.id, s.v)
WHEN NOT MATCHED BY SOURCE THEN DELETE;
RETURN 0";
        let stmts = statements(src);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("MERGE") && stmts[0].ends_with("DELETE;"));
        assert_eq!(stmts[1], "RETURN 0");
    }

    #[test]
    fn case_expressions_do_not_close_blocks() {
        let src = "CREATE PROC p AS BEGIN SELECT CASE WHEN @a = 1 THEN 'x' ELSE 'y' END AS v; SET @b = 1 END";
        assert_eq!(
            statements(src),
            vec![
                "SELECT CASE WHEN @a = 1 THEN 'x' ELSE 'y' END AS v;",
                "SET @b = 1"
            ]
        );
    }

    #[test]
    fn try_catch_and_transactions() {
        let src = "CREATE PROC p AS
BEGIN TRY
  BEGIN TRAN
  DELETE FROM t
  COMMIT TRAN
END TRY
BEGIN CATCH
  ROLLBACK;
  THROW;
END CATCH";
        assert_eq!(
            statements(src),
            vec!["BEGIN TRAN", "DELETE FROM t", "COMMIT TRAN", "ROLLBACK;", "THROW;"]
        );
    }

    #[test]
    fn trigger_update_predicate_and_labels() {
        let src = "CREATE TRIGGER trg ON dbo.T AFTER INSERT, UPDATE AS
IF UPDATE(Col) PRINT 'changed'
retry:
WHILE @i < 3 SET @i += 1
GOTO retry";
        assert_eq!(
            statements(src),
            vec![
                "IF UPDATE(Col)",
                "PRINT 'changed'",
                "WHILE @i < 3",
                "SET @i += 1",
                "GOTO retry"
            ]
        );
    }

    #[test]
    fn header_execute_as_and_parameter_as_are_skipped() {
        let src = "CREATE PROCEDURE p @a AS int = 1 WITH EXECUTE AS OWNER AS SELECT @a";
        assert_eq!(statements(src), vec!["SELECT @a"]);
    }

    #[test]
    fn inline_function_is_one_statement() {
        let src = "CREATE FUNCTION dbo.f (@a int) RETURNS TABLE AS RETURN (SELECT a FROM t WHERE a = @a)";
        assert_eq!(
            statements(src),
            vec!["RETURN (SELECT a FROM t WHERE a = @a)"]
        );
    }

    #[test]
    fn scalar_function_body() {
        let src = "CREATE FUNCTION dbo.f (@a int) RETURNS int WITH SCHEMABINDING AS BEGIN DECLARE @r int = @a * 2; RETURN @r END";
        assert_eq!(statements(src), vec!["DECLARE @r int = @a * 2;", "RETURN @r"]);
    }

    #[test]
    fn drop_if_exists_is_one_statement() {
        let src = "CREATE PROC p AS DROP TABLE IF EXISTS #t CREATE TABLE #t (a int)";
        assert_eq!(
            statements(src),
            vec!["DROP TABLE IF EXISTS #t", "CREATE TABLE #t (a int)"]
        );
    }

    #[test]
    fn keywords_in_strings_and_comments_are_ignored() {
        let src = "CREATE PROC p AS\nPRINT 'SELECT; END' -- SELECT\n/* BEGIN */ SELECT 1";
        assert_eq!(statements(src), vec!["PRINT 'SELECT; END'", "SELECT 1"]);
    }

    #[test]
    fn bare_batches_have_no_header() {
        assert_eq!(statements("SELECT 1; SELECT 2"), vec!["SELECT 1;", "SELECT 2"]);
        assert!(segment_source("").unwrap().is_empty());
    }

    #[test]
    fn malformed_sources_are_rejected() {
        assert_eq!(
            segment_source("CREATE PROC p AS BEGIN SELECT 1").unwrap_err(),
            SegmentationError::UnterminatedBlock {
                block: "BEGIN",
                line: 1
            }
        );
        assert_eq!(
            segment_source("CREATE PROC p AS SELECT (1").unwrap_err(),
            SegmentationError::UnbalancedParenthesis { line: 1 }
        );
        assert_eq!(
            segment_source("CREATE PROC p AS\nSELECT 1\nEND").unwrap_err(),
            SegmentationError::UnmatchedEnd { line: 3 }
        );
        assert_eq!(
            segment_source("CREATE PROCEDURE p SELECT 1").unwrap_err(),
            SegmentationError::MissingBody
        );
        assert!(matches!(
            segment_source("CREATE PROC p AS SELECT CASE WHEN 1 = 1 THEN 1"),
            Err(SegmentationError::UnterminatedBlock { block: "CASE", .. })
        ));
    }

    #[test]
    fn excluded_names_yield_no_spans() {
        let filter = ExcludeFilter::new(["Internal*"]);
        let segmenter = SourceSegmenter::new(&filter);
        assert!(segmenter
            .segment("dbo.InternalHelper", "CREATE PROC p AS SELECT 1")
            .unwrap()
            .is_empty());
        assert_eq!(
            segmenter
                .segment("dbo.Proc1", "CREATE PROC p AS SELECT 1")
                .unwrap()
                .len(),
            1
        );
    }
}
